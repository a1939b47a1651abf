//! The daemon's HTTP surface: the blueprint endpoint the CLI drives and
//! the counters debug endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use tracing::info;

use kelda_db::{Conn, StoreError};

pub fn router(conn: Conn) -> Router {
    Router::new()
        .route("/api/blueprint", get(get_blueprint).post(post_blueprint))
        .route("/debug/counters", get(counters))
        .with_state(conn)
}

async fn get_blueprint(State(conn): State<Conn>) -> Result<String, (StatusCode, String)> {
    conn.txn(&[])
        .run(|view| {
            Ok::<_, StoreError>(
                view.all::<kelda_db::Blueprint>()
                    .into_iter()
                    .next()
                    .map(|row| row.blueprint)
                    .unwrap_or_default(),
            )
        })
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}

async fn post_blueprint(
    State(conn): State<Conn>,
    body: String,
) -> Result<&'static str, (StatusCode, String)> {
    match kelda_engine::update_policy(&conn, &body) {
        Ok(()) => {
            info!("new blueprint accepted");
            Ok("ok")
        }
        Err(kelda_engine::EngineError::Parse(err)) => {
            Err((StatusCode::BAD_REQUEST, err.to_string()))
        }
        Err(err) => Err((StatusCode::INTERNAL_SERVER_ERROR, err.to_string())),
    }
}

async fn counters() -> Json<kelda_counter::Snapshot> {
    Json(kelda_counter::dump())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blueprint_round_trip() {
        let conn = Conn::new();
        let raw = r#"{"Namespace": "prod"}"#;

        post_blueprint(State(conn.clone()), raw.to_string())
            .await
            .unwrap();
        let stored = get_blueprint(State(conn)).await.unwrap();
        assert_eq!(stored, raw);
    }

    #[tokio::test]
    async fn bad_blueprint_is_a_400() {
        let conn = Conn::new();
        let err = post_blueprint(State(conn.clone()), "{nope".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        // And the store is untouched.
        assert_eq!(get_blueprint(State(conn)).await.unwrap(), "");
    }
}
