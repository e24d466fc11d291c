pub mod status;
pub mod subscribe;

use actix_web::web;

/// Register the push API under /api/v1/push
pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/push")
            .route("/subscribe/{user_id}", web::get().to(subscribe::subscribe))
            .route("/status/{user_id}", web::get().to(status::push_status))
            .route("/stats", web::get().to(status::push_stats))
            .route("/connections", web::get().to(status::list_connections))
            .route("/notify/{user_id}", web::post().to(status::notify_user))
            .route("/broadcast", web::post().to(status::broadcast)),
    );
}
