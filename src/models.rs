use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Book {
    pub id: i64,
    pub title: String,
    pub author: String,
    pub isbn: Option<String>,
    pub category: Option<String>,
    pub total_copies: i64,
    pub available_copies: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub membership_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Loan {
    pub id: i64,
    pub user_id: i64,
    pub book_id: i64,
    pub loan_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub return_date: Option<DateTime<Utc>>,
    pub status: String,
}

/// Loan joined with the member's name and the book's title, the shape the
/// loan listings render from.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LoanRecord {
    pub id: i64,
    pub user_id: i64,
    pub book_id: i64,
    pub user_name: String,
    pub book_title: String,
    pub loan_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub return_date: Option<DateTime<Utc>>,
    pub status: String,
}

/// One row of the most-borrowed report. Books that were never lent appear
/// with a count of zero.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BorrowCount {
    pub id: i64,
    pub title: String,
    pub author: String,
    pub borrow_count: i64,
}
