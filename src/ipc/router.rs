use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

type TryHandle = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

/// Handler families, asked in order until one claims the method.
const FAMILIES: [TryHandle; 13] = [
    handlers::core::try_handle,
    handlers::setup::try_handle,
    handlers::auth::try_handle,
    handlers::students::try_handle,
    handlers::teachers::try_handle,
    handlers::projects::try_handle,
    handlers::choices::try_handle,
    handlers::assignments::try_handle,
    handlers::supervision::try_handle,
    handlers::documents::try_handle,
    handlers::internships::try_handle,
    handlers::notifications::try_handle,
    handlers::backup_exchange::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    for try_handle in FAMILIES {
        if let Some(resp) = try_handle(state, &req) {
            return resp;
        }
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
