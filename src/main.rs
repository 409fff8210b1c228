mod library;
mod models;

use actix_web::{
    delete, get,
    middleware::Logger,
    post, put,
    web::{route, Data, Json, Path, Query},
    App, HttpResponse, HttpServer,
};
use library::Library;
use serde::Deserialize;
use serde_json::json;
use std::{
    env::var,
    net::{Ipv4Addr, SocketAddrV4},
};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let port: u16 = var("PORT")
        .ok()
        .and_then(|text| text.parse().ok())
        .unwrap_or(3000);

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);

    let db_url = var("DATABASE_URL").unwrap_or_else(|_| "sqlite:library.db".to_string());
    let library = Library::new(&db_url).await?;

    log::info!("listening on {addr}, store at {db_url}");

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(Data::new(library.clone()))
            .service(book_list)
            .service(book_search)
            .service(book_get)
            .service(book_create)
            .service(book_update)
            .service(book_delete)
            .service(user_list)
            .service(user_search)
            .service(user_get)
            .service(user_create)
            .service(user_update)
            .service(user_delete)
            .service(loan_create)
            .service(loan_return)
            .service(loan_list)
            .service(loan_list_active)
            .service(most_borrowed)
            .default_service(route().to(fallback))
    })
    .bind(addr)?
    .run()
    .await?;

    Ok(())
}

#[derive(Debug, Deserialize)]
struct BookForm {
    title: String,
    author: String,
    isbn: Option<String>,
    category: Option<String>,
    #[serde(default = "default_copies")]
    total_copies: i64,
}

fn default_copies() -> i64 {
    1
}

#[get("/books")]
async fn book_list(library: Data<Library>) -> HttpResponse {
    let Ok(books) = library.list_books().await else {
        return HttpResponse::InternalServerError().body("failed to list books");
    };

    HttpResponse::Ok().json(books)
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    keyword: String,
}

#[get("/books/search")]
async fn book_search(query: Query<SearchQuery>, library: Data<Library>) -> HttpResponse {
    let Ok(books) = library.search_books(query.keyword.as_str()).await else {
        return HttpResponse::InternalServerError().body("failed to search books");
    };

    HttpResponse::Ok().json(books)
}

#[get("/books/{id}")]
async fn book_get(id: Path<i64>, library: Data<Library>) -> HttpResponse {
    match library.get_book(*id).await {
        Ok(Some(book)) => HttpResponse::Ok().json(book),
        Ok(None) => HttpResponse::NotFound().body("no such book"),
        Err(_) => HttpResponse::InternalServerError().body("failed to fetch book"),
    }
}

#[post("/books")]
async fn book_create(form: Json<BookForm>, library: Data<Library>) -> HttpResponse {
    let Ok(id) = library
        .add_book(
            form.title.as_str(),
            form.author.as_str(),
            form.isbn.as_deref(),
            form.category.as_deref(),
            form.total_copies,
        )
        .await
    else {
        return HttpResponse::BadRequest().body("failed to add book");
    };

    HttpResponse::Ok().json(json!({ "id": id }))
}

#[put("/books/{id}")]
async fn book_update(id: Path<i64>, form: Json<BookForm>, library: Data<Library>) -> HttpResponse {
    let Ok(updated) = library
        .update_book(
            *id,
            form.title.as_str(),
            form.author.as_str(),
            form.isbn.as_deref(),
            form.category.as_deref(),
            form.total_copies,
        )
        .await
    else {
        return HttpResponse::BadRequest().body("failed to update book");
    };

    if !updated {
        return HttpResponse::NotFound().body("no such book");
    }

    HttpResponse::Ok().body("book updated")
}

#[delete("/books/{id}")]
async fn book_delete(id: Path<i64>, library: Data<Library>) -> HttpResponse {
    match library.delete_book(*id).await {
        Ok(true) => HttpResponse::Ok().body("book deleted"),
        Ok(false) => HttpResponse::NotFound().body("no such book"),
        Err(_) => HttpResponse::InternalServerError().body("failed to delete book"),
    }
}

#[derive(Debug, Deserialize)]
struct UserForm {
    name: String,
    email: Option<String>,
    phone: Option<String>,
    address: Option<String>,
}

#[get("/users")]
async fn user_list(library: Data<Library>) -> HttpResponse {
    let Ok(users) = library.list_users().await else {
        return HttpResponse::InternalServerError().body("failed to list users");
    };

    HttpResponse::Ok().json(users)
}

#[get("/users/search")]
async fn user_search(query: Query<SearchQuery>, library: Data<Library>) -> HttpResponse {
    let Ok(users) = library.search_users(query.keyword.as_str()).await else {
        return HttpResponse::InternalServerError().body("failed to search users");
    };

    HttpResponse::Ok().json(users)
}

#[get("/users/{id}")]
async fn user_get(id: Path<i64>, library: Data<Library>) -> HttpResponse {
    match library.get_user(*id).await {
        Ok(Some(user)) => HttpResponse::Ok().json(user),
        Ok(None) => HttpResponse::NotFound().body("no such user"),
        Err(_) => HttpResponse::InternalServerError().body("failed to fetch user"),
    }
}

#[post("/users")]
async fn user_create(form: Json<UserForm>, library: Data<Library>) -> HttpResponse {
    let Ok(id) = library
        .add_user(
            form.name.as_str(),
            form.email.as_deref(),
            form.phone.as_deref(),
            form.address.as_deref(),
        )
        .await
    else {
        return HttpResponse::BadRequest().body("failed to add user");
    };

    HttpResponse::Ok().json(json!({ "id": id }))
}

#[put("/users/{id}")]
async fn user_update(id: Path<i64>, form: Json<UserForm>, library: Data<Library>) -> HttpResponse {
    let Ok(updated) = library
        .update_user(
            *id,
            form.name.as_str(),
            form.email.as_deref(),
            form.phone.as_deref(),
            form.address.as_deref(),
        )
        .await
    else {
        return HttpResponse::BadRequest().body("failed to update user");
    };

    if !updated {
        return HttpResponse::NotFound().body("no such user");
    }

    HttpResponse::Ok().body("user updated")
}

#[delete("/users/{id}")]
async fn user_delete(id: Path<i64>, library: Data<Library>) -> HttpResponse {
    match library.delete_user(*id).await {
        Ok(true) => HttpResponse::Ok().body("user deleted"),
        Ok(false) => HttpResponse::NotFound().body("no such user"),
        Err(_) => HttpResponse::InternalServerError().body("failed to delete user"),
    }
}

#[derive(Debug, Deserialize)]
struct LoanForm {
    user_id: i64,
    book_id: i64,
    #[serde(default = "default_days")]
    days: i64,
}

fn default_days() -> i64 {
    14
}

#[post("/loans")]
async fn loan_create(form: Json<LoanForm>, library: Data<Library>) -> HttpResponse {
    let Ok(id) = library.create_loan(form.user_id, form.book_id, form.days).await else {
        return HttpResponse::BadRequest().body("failed to create loan");
    };

    HttpResponse::Ok().json(json!({ "id": id }))
}

#[post("/loans/{id}/return")]
async fn loan_return(id: Path<i64>, library: Data<Library>) -> HttpResponse {
    match library.return_book(*id).await {
        Ok(true) => HttpResponse::Ok().body("book returned"),
        Ok(false) => HttpResponse::BadRequest().body("loan is not returnable"),
        Err(_) => HttpResponse::InternalServerError().body("failed to return book"),
    }
}

#[get("/loans")]
async fn loan_list(library: Data<Library>) -> HttpResponse {
    let Ok(loans) = library.list_loans().await else {
        return HttpResponse::InternalServerError().body("failed to list loans");
    };

    HttpResponse::Ok().json(loans)
}

#[get("/loans/active")]
async fn loan_list_active(library: Data<Library>) -> HttpResponse {
    let Ok(loans) = library.list_active_loans().await else {
        return HttpResponse::InternalServerError().body("failed to list active loans");
    };

    HttpResponse::Ok().json(loans)
}

#[derive(Debug, Deserialize)]
struct ReportQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    10
}

#[get("/reports/most_borrowed")]
async fn most_borrowed(query: Query<ReportQuery>, library: Data<Library>) -> HttpResponse {
    let Ok(report) = library.most_borrowed_books(query.limit).await else {
        return HttpResponse::InternalServerError().body("failed to build report");
    };

    HttpResponse::Ok().json(report)
}

async fn fallback() -> HttpResponse {
    HttpResponse::NotFound().body("no endpoint, but connection to api is successful.")
}
