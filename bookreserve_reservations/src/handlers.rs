use std::sync::Arc;

use actix_web::http::header::LOCATION;
use actix_web::web::Data;
use actix_web::{Error, HttpRequest, HttpResponse};
use paperclip::actix::{api_v2_operation, web};

use crate::access_tokens::{bearer_token, AccessTokens};
use crate::api::{
    BookDetails, BookId, CancelReservationResponse, CreateReservationRequest, ErrorResponse,
    GetAllBooksResponse, Reservation, ReservationId, ReservationStatus, ReservationView,
    ReservationsQuery, TokenResponse, UserDetails, UserId,
};
use crate::reservations_store::{ReservationsStore, ReservationsStoreError};

#[api_v2_operation]
pub async fn health() -> Result<HttpResponse, Error> {
    Ok(HttpResponse::Ok().finish())
}

/// Resolves the bearer credential to a user, or produces the 401 response.
async fn authenticate(
    req: &HttpRequest,
    access_tokens: &Data<Arc<dyn AccessTokens>>,
) -> Result<UserId, HttpResponse> {
    let Some(token) = bearer_token(req) else {
        return Err(HttpResponse::Unauthorized().json(ErrorResponse {
            error: "Missing bearer token".to_string(),
        }));
    };

    match access_tokens.resolve(token).await {
        Ok(Some(user_id)) => Ok(user_id),
        Ok(None) => Err(HttpResponse::Unauthorized().json(ErrorResponse {
            error: "Invalid bearer token".to_string(),
        })),
        Err(err) => {
            tracing::error!("Token lookup failed {}", err);
            Err(HttpResponse::InternalServerError().finish())
        }
    }
}

/// Joins the display book fields onto reservation records at response time.
async fn reservation_views(
    store: &Arc<dyn ReservationsStore>,
    reservations: Vec<Reservation>,
) -> Result<Vec<ReservationView>, ReservationsStoreError> {
    let mut views = Vec::with_capacity(reservations.len());
    for reservation in reservations {
        let book = store.get_book(reservation.book_id).await?;
        views.push(ReservationView::new(reservation, book));
    }
    Ok(views)
}

#[api_v2_operation]
pub async fn create_reservation(
    req: HttpRequest,
    store: Data<Arc<dyn ReservationsStore>>,
    access_tokens: Data<Arc<dyn AccessTokens>>,
    body: web::Json<CreateReservationRequest>,
) -> Result<HttpResponse, Error> {
    let user_id = match authenticate(&req, &access_tokens).await {
        Ok(user_id) => user_id,
        Err(response) => return Ok(response),
    };

    Ok(
        match store.create_reservation(user_id, body.book_id).await {
            Ok(reservation) => {
                match reservation_views(store.get_ref(), vec![reservation]).await {
                    Ok(mut views) => HttpResponse::Ok().json(views.remove(0)),
                    Err(err) => {
                        tracing::error!("Create reservation failed to join book {}", err);
                        HttpResponse::InternalServerError().finish()
                    }
                }
            }
            Err(
                err @ (ReservationsStoreError::UserNotFound(_)
                | ReservationsStoreError::BookNotFound(_)),
            ) => HttpResponse::BadRequest().json(ErrorResponse {
                error: err.to_string(),
            }),
            Err(err) => {
                tracing::error!("Create reservation failed {}", err);
                HttpResponse::InternalServerError().finish()
            }
        },
    )
}

#[api_v2_operation]
pub async fn my_reservations(
    req: HttpRequest,
    store: Data<Arc<dyn ReservationsStore>>,
    access_tokens: Data<Arc<dyn AccessTokens>>,
    query: web::Query<ReservationsQuery>,
) -> Result<HttpResponse, Error> {
    let user_id = match authenticate(&req, &access_tokens).await {
        Ok(user_id) => user_id,
        Err(response) => return Ok(response),
    };

    let views = match store.list_reservations(user_id, query.status).await {
        Ok(reservations) => reservation_views(store.get_ref(), reservations).await,
        Err(err) => Err(err),
    };

    Ok(match views {
        Ok(views) => HttpResponse::Ok().json(views),
        Err(err) => {
            tracing::error!("List reservations failed {}", err);
            HttpResponse::InternalServerError().finish()
        }
    })
}

#[api_v2_operation]
pub async fn cancel_reservation(
    req: HttpRequest,
    store: Data<Arc<dyn ReservationsStore>>,
    access_tokens: Data<Arc<dyn AccessTokens>>,
    reservation_id: web::Path<ReservationId>,
) -> Result<HttpResponse, Error> {
    let user_id = match authenticate(&req, &access_tokens).await {
        Ok(user_id) => user_id,
        Err(response) => return Ok(response),
    };
    let reservation_id = reservation_id.into_inner();

    Ok(
        match store.cancel_reservation(reservation_id, user_id).await {
            Ok(()) => HttpResponse::Ok().json(CancelReservationResponse {
                id: reservation_id,
                status: ReservationStatus::Cancelled,
            }),
            Err(err @ ReservationsStoreError::ReservationNotFound(_)) => {
                HttpResponse::NotFound().json(ErrorResponse {
                    error: err.to_string(),
                })
            }
            Err(err @ ReservationsStoreError::AlreadyCancelled(_)) => {
                HttpResponse::BadRequest().json(ErrorResponse {
                    error: err.to_string(),
                })
            }
            Err(err) => {
                tracing::error!("Cancel reservation failed {}", err);
                HttpResponse::InternalServerError().finish()
            }
        },
    )
}

#[api_v2_operation]
pub async fn add_user(
    store: Data<Arc<dyn ReservationsStore>>,
    details: web::Json<UserDetails>,
) -> Result<HttpResponse, Error> {
    Ok(match store.add_user(details.into_inner()).await {
        Ok(user_id) => HttpResponse::Ok()
            .append_header((LOCATION, format!("/api/user/{}", user_id)))
            .finish(),
        Err(err) => {
            tracing::error!("Add user failed {}", err);
            HttpResponse::InternalServerError().finish()
        }
    })
}

#[api_v2_operation]
pub async fn get_user(
    store: Data<Arc<dyn ReservationsStore>>,
    user_id: web::Path<UserId>,
) -> Result<HttpResponse, Error> {
    Ok(match store.get_user(user_id.into_inner()).await {
        Ok(details) => HttpResponse::Ok().json(details),
        Err(ReservationsStoreError::UserNotFound(_)) => HttpResponse::NotFound().finish(),
        Err(err) => {
            tracing::error!("Get user failed {}", err);
            HttpResponse::InternalServerError().finish()
        }
    })
}

#[api_v2_operation]
pub async fn issue_token(
    store: Data<Arc<dyn ReservationsStore>>,
    access_tokens: Data<Arc<dyn AccessTokens>>,
    user_id: web::Path<UserId>,
) -> Result<HttpResponse, Error> {
    let user_id = user_id.into_inner();

    // Only known users get credentials
    Ok(match store.get_user(user_id).await {
        Ok(_) => match access_tokens.issue(user_id).await {
            Ok(token) => HttpResponse::Ok().json(TokenResponse { token }),
            Err(err) => {
                tracing::error!("Issue token failed {}", err);
                HttpResponse::InternalServerError().finish()
            }
        },
        Err(err @ ReservationsStoreError::UserNotFound(_)) => {
            HttpResponse::NotFound().json(ErrorResponse {
                error: err.to_string(),
            })
        }
        Err(err) => {
            tracing::error!("Issue token failed {}", err);
            HttpResponse::InternalServerError().finish()
        }
    })
}

#[api_v2_operation]
pub async fn add_book(
    store: Data<Arc<dyn ReservationsStore>>,
    details: web::Json<BookDetails>,
) -> Result<HttpResponse, Error> {
    Ok(match store.add_book(details.into_inner()).await {
        Ok(book_id) => HttpResponse::Ok()
            .append_header((LOCATION, format!("/api/book/{}", book_id)))
            .finish(),
        Err(err) => {
            tracing::error!("Add book failed {}", err);
            HttpResponse::InternalServerError().finish()
        }
    })
}

#[api_v2_operation]
pub async fn get_book(
    store: Data<Arc<dyn ReservationsStore>>,
    book_id: web::Path<BookId>,
) -> Result<HttpResponse, Error> {
    Ok(match store.get_book(book_id.into_inner()).await {
        Ok(details) => HttpResponse::Ok().json(details),
        Err(ReservationsStoreError::BookNotFound(_)) => HttpResponse::NotFound().finish(),
        Err(err) => {
            tracing::error!("Get book failed {}", err);
            HttpResponse::InternalServerError().finish()
        }
    })
}

#[api_v2_operation]
pub async fn list_books(
    store: Data<Arc<dyn ReservationsStore>>,
) -> Result<HttpResponse, Error> {
    Ok(match store.list_books().await {
        Ok(books) => HttpResponse::Ok().json(GetAllBooksResponse { books }),
        Err(err) => {
            tracing::error!("List books failed {}", err);
            HttpResponse::InternalServerError().finish()
        }
    })
}
