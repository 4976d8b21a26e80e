use paperclip::actix::web;

use crate::handlers;

pub fn config_app(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(handlers::health)))
        .service(
            web::scope("/api")
                .service(web::resource("/books").route(web::get().to(handlers::list_books)))
                .service(
                    web::scope("/book")
                        .service(web::resource("").route(web::post().to(handlers::add_book)))
                        .service(
                            web::resource("/{book_id}").route(web::get().to(handlers::get_book)),
                        ),
                )
                .service(
                    web::scope("/user")
                        .service(web::resource("").route(web::post().to(handlers::add_user)))
                        .service(
                            web::scope("/{user_id}")
                                .service(web::resource("").route(web::get().to(handlers::get_user)))
                                .service(
                                    web::resource("/token")
                                        .route(web::post().to(handlers::issue_token)),
                                ),
                        ),
                )
                .service(
                    web::scope("/reservations")
                        .service(
                            web::resource("")
                                .route(web::post().to(handlers::create_reservation)),
                        )
                        .service(
                            web::resource("/my-reservations")
                                .route(web::get().to(handlers::my_reservations)),
                        )
                        .service(
                            web::resource("/{reservation_id}/cancel")
                                .route(web::put().to(handlers::cancel_reservation)),
                        ),
                ),
        );
}
