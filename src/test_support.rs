//! Helpers shared by unit tests

use axum::Router;
use uuid::Uuid;

use crate::models::{Playlist, PlaylistStatus, SourceKind};

/// Serve `router` on an ephemeral local port and return its base URL
pub async fn spawn_server(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

pub fn playlist(kind: SourceKind, base_url: &str) -> Playlist {
    Playlist {
        id: Uuid::new_v4(),
        name: format!("{} test", kind),
        source_kind: kind,
        base_url: base_url.to_string(),
        mac: None,
        username: None,
        password: None,
        api_path: None,
        portal_token: None,
        portal_secret: None,
        settings: Default::default(),
        status: PlaylistStatus::Idle,
        last_error: None,
        channel_count: 0,
        last_sync_at: None,
    }
}
