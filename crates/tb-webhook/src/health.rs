//! Dependency liveness endpoint.

use std::time::{Duration, Instant};

use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::{json, Map, Value};

use crate::AppState;

const REDIS_PING_TIMEOUT: Duration = Duration::from_secs(2);

/// `GET /`: report bus and claim-store connectivity. Any dependency down
/// turns the whole response into a 500 with `status: "down"`.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let mut healthy = true;
    let mut result = Map::new();

    let mut amqp = Map::new();
    if state.amqp.status().connected() {
        amqp.insert("connection".to_string(), json!(true));
        amqp.insert(
            "time_since_last_heartbeat".to_string(),
            json!(state.bus_monitor.seconds_since_last_beat()),
        );
    } else {
        amqp.insert("connection".to_string(), json!(false));
        healthy = false;
    }
    result.insert("amqp".to_string(), Value::Object(amqp));

    if let Some(redis) = &state.redis {
        let mut conn = redis.clone();
        let started = Instant::now();
        let ping = tokio::time::timeout(
            REDIS_PING_TIMEOUT,
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await;
        let status = match ping {
            Ok(Ok(_)) => json!({
                "connection": true,
                "response_time": started.elapsed().as_secs_f64(),
            }),
            _ => {
                healthy = false;
                json!({"connection": false})
            }
        };
        result.insert("redis".to_string(), status);
    }

    result.insert(
        "status".to_string(),
        json!(if healthy { "ok" } else { "down" }),
    );

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (code, Json(Value::Object(result)))
}
