use crate::models::{Book, BorrowCount, Loan, LoanRecord, User};
use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS books (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        author TEXT NOT NULL,
        isbn TEXT UNIQUE,
        category TEXT,
        total_copies INTEGER NOT NULL DEFAULT 1,
        available_copies INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        email TEXT UNIQUE,
        phone TEXT,
        address TEXT,
        membership_date TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS loans (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id),
        book_id INTEGER NOT NULL REFERENCES books(id),
        loan_date TEXT NOT NULL,
        due_date TEXT NOT NULL,
        return_date TEXT,
        status TEXT NOT NULL DEFAULT 'active'
    )",
];

#[derive(Debug, Clone)]
pub struct Library {
    pool: SqlitePool,
}

impl Library {
    pub async fn new(db_url: &str) -> Result<Self> {
        // sqlx turns on PRAGMA foreign_keys by default; the documented
        // policy is no cascade and dangling loan references on delete.
        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .foreign_keys(false);

        // The store serves exactly one active user (see the single-session
        // model); one connection also keeps `sqlite::memory:` coherent.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        Ok(Library { pool })
    }

    pub async fn add_book(
        &self,
        title: &str,
        author: &str,
        isbn: Option<&str>,
        category: Option<&str>,
        total_copies: i64,
    ) -> Result<i64> {
        if title.trim().is_empty() || author.trim().is_empty() {
            bail!("title and author are required");
        }

        let result = sqlx::query(
            "INSERT INTO books (title, author, isbn, category, total_copies, available_copies, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(title)
        .bind(author)
        .bind(blank_to_null(isbn))
        .bind(blank_to_null(category))
        .bind(total_copies)
        .bind(total_copies)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    // Shrinking total_copies clamps available_copies down with it, so
    // 0 <= available_copies <= total_copies keeps holding after edits.
    pub async fn update_book(
        &self,
        id: i64,
        title: &str,
        author: &str,
        isbn: Option<&str>,
        category: Option<&str>,
        total_copies: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE books
             SET title = ?, author = ?, isbn = ?, category = ?, total_copies = ?,
                 available_copies = MIN(available_copies, ?)
             WHERE id = ?",
        )
        .bind(title)
        .bind(author)
        .bind(blank_to_null(isbn))
        .bind(blank_to_null(category))
        .bind(total_copies)
        .bind(total_copies)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // No cascade: loans referencing the deleted book keep their book_id.
    pub async fn delete_book(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM books WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_books(&self) -> Result<Vec<Book>> {
        let books = sqlx::query_as::<_, Book>("SELECT * FROM books ORDER BY title")
            .fetch_all(&self.pool)
            .await?;

        Ok(books)
    }

    pub async fn get_book(&self, id: i64) -> Result<Option<Book>> {
        let book = sqlx::query_as::<_, Book>("SELECT * FROM books WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(book)
    }

    pub async fn search_books(&self, keyword: &str) -> Result<Vec<Book>> {
        let pattern = format!("%{keyword}%");

        let books = sqlx::query_as::<_, Book>(
            "SELECT * FROM books
             WHERE title LIKE ? OR author LIKE ? OR isbn LIKE ?
             ORDER BY title",
        )
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;

        Ok(books)
    }

    pub async fn add_user(
        &self,
        name: &str,
        email: Option<&str>,
        phone: Option<&str>,
        address: Option<&str>,
    ) -> Result<i64> {
        if name.trim().is_empty() {
            bail!("name is required");
        }

        let result = sqlx::query(
            "INSERT INTO users (name, email, phone, address, membership_date)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(blank_to_null(email))
        .bind(blank_to_null(phone))
        .bind(blank_to_null(address))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn update_user(
        &self,
        id: i64,
        name: &str,
        email: Option<&str>,
        phone: Option<&str>,
        address: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET name = ?, email = ?, phone = ?, address = ? WHERE id = ?",
        )
        .bind(name)
        .bind(blank_to_null(email))
        .bind(blank_to_null(phone))
        .bind(blank_to_null(address))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_user(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        Ok(users)
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    pub async fn search_users(&self, keyword: &str) -> Result<Vec<User>> {
        let pattern = format!("%{keyword}%");

        let users = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE name LIKE ? OR email LIKE ? ORDER BY name",
        )
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;

        Ok(users)
    }

    /// Lends a book to a member. The availability decrement is guarded, so a
    /// book with no available copies cannot be lent; insert and decrement
    /// commit together or not at all.
    pub async fn create_loan(&self, user_id: i64, book_id: i64, days: i64) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let user_exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE id = ?)")
            .bind(user_id)
            .fetch_one(&mut tx)
            .await?;
        if !user_exists {
            bail!("user {user_id} not found");
        }

        let taken = sqlx::query(
            "UPDATE books SET available_copies = available_copies - 1
             WHERE id = ? AND available_copies > 0",
        )
        .bind(book_id)
        .execute(&mut tx)
        .await?;
        if taken.rows_affected() == 0 {
            bail!("book {book_id} has no available copies");
        }

        let loan_date = Utc::now();
        let result = sqlx::query(
            "INSERT INTO loans (user_id, book_id, loan_date, due_date, status)
             VALUES (?, ?, ?, ?, 'active')",
        )
        .bind(user_id)
        .bind(book_id)
        .bind(loan_date)
        .bind(loan_date + Duration::days(days))
        .execute(&mut tx)
        .await?;

        tx.commit().await?;
        Ok(result.last_insert_rowid())
    }

    /// Closes an active loan and puts the copy back on the shelf. Only
    /// `active` loans transition; returning an already-returned or unknown
    /// loan is a no-op reported as `false`.
    pub async fn return_book(&self, loan_id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let book_id: Option<i64> =
            sqlx::query_scalar("SELECT book_id FROM loans WHERE id = ? AND status = 'active'")
                .bind(loan_id)
                .fetch_optional(&mut tx)
                .await?;
        let Some(book_id) = book_id else {
            return Ok(false);
        };

        sqlx::query("UPDATE loans SET return_date = ?, status = 'returned' WHERE id = ?")
            .bind(Utc::now())
            .bind(loan_id)
            .execute(&mut tx)
            .await?;

        // The book may have been edited or deleted while out; clamp so the
        // increment never pushes past total_copies.
        sqlx::query(
            "UPDATE books SET available_copies = MIN(available_copies + 1, total_copies)
             WHERE id = ?",
        )
        .bind(book_id)
        .execute(&mut tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn get_loan(&self, id: i64) -> Result<Option<Loan>> {
        let loan = sqlx::query_as::<_, Loan>("SELECT * FROM loans WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(loan)
    }

    pub async fn list_loans(&self) -> Result<Vec<LoanRecord>> {
        let loans = sqlx::query_as::<_, LoanRecord>(
            "SELECT l.id, l.user_id, l.book_id, u.name AS user_name, b.title AS book_title,
                    l.loan_date, l.due_date, l.return_date, l.status
             FROM loans l
             JOIN users u ON l.user_id = u.id
             JOIN books b ON l.book_id = b.id
             ORDER BY l.loan_date DESC, l.id DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(loans)
    }

    pub async fn list_active_loans(&self) -> Result<Vec<LoanRecord>> {
        let loans = sqlx::query_as::<_, LoanRecord>(
            "SELECT l.id, l.user_id, l.book_id, u.name AS user_name, b.title AS book_title,
                    l.loan_date, l.due_date, l.return_date, l.status
             FROM loans l
             JOIN users u ON l.user_id = u.id
             JOIN books b ON l.book_id = b.id
             WHERE l.status = 'active'
             ORDER BY l.due_date",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(loans)
    }

    pub async fn most_borrowed_books(&self, limit: i64) -> Result<Vec<BorrowCount>> {
        let books = sqlx::query_as::<_, BorrowCount>(
            "SELECT b.id, b.title, b.author, COUNT(l.id) AS borrow_count
             FROM books b
             LEFT JOIN loans l ON b.id = l.book_id
             GROUP BY b.id
             ORDER BY borrow_count DESC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(books)
    }
}

// Optional text fields arrive from forms as empty strings; store them as
// NULL so the UNIQUE constraints on isbn and email never see two blanks.
fn blank_to_null(value: Option<&str>) -> Option<&str> {
    value.filter(|text| !text.trim().is_empty())
}

#[cfg(test)]
mod test {
    use super::Library;
    use chrono::Duration;

    async fn fresh() -> Library {
        Library::new("sqlite::memory:").await.unwrap()
    }

    #[actix_web::test]
    async fn add_book_starts_fully_available() {
        let lib = fresh().await;

        let id = lib
            .add_book("The Hobbit", "J.R.R. Tolkien", Some("9780261103344"), Some("Fantasy"), 3)
            .await
            .unwrap();

        let book = lib.get_book(id).await.unwrap().unwrap();
        assert_eq!(book.title, "The Hobbit");
        assert_eq!(book.author, "J.R.R. Tolkien");
        assert_eq!(book.isbn.as_deref(), Some("9780261103344"));
        assert_eq!(book.category.as_deref(), Some("Fantasy"));
        assert_eq!(book.total_copies, 3);
        assert_eq!(book.available_copies, 3);
    }

    #[actix_web::test]
    async fn add_book_rejects_duplicate_isbn_but_not_blank() {
        let lib = fresh().await;

        lib.add_book("Dune", "Frank Herbert", Some("9780441013593"), None, 1)
            .await
            .unwrap();
        let dup = lib
            .add_book("Dune (reissue)", "Frank Herbert", Some("9780441013593"), None, 1)
            .await;
        assert!(dup.is_err());

        // Blank identifiers are stored as NULL and never collide.
        lib.add_book("Untitled One", "Anon", Some(""), None, 1).await.unwrap();
        lib.add_book("Untitled Two", "Anon", Some(""), None, 1).await.unwrap();
    }

    #[actix_web::test]
    async fn add_book_requires_title_and_author() {
        let lib = fresh().await;

        assert!(lib.add_book("", "Someone", None, None, 1).await.is_err());
        assert!(lib.add_book("Something", "  ", None, None, 1).await.is_err());
    }

    #[actix_web::test]
    async fn update_and_delete_report_missing_rows() {
        let lib = fresh().await;

        assert!(!lib.update_book(99, "X", "Y", None, None, 1).await.unwrap());
        assert!(!lib.delete_book(99).await.unwrap());
        assert!(!lib.update_user(99, "X", None, None, None).await.unwrap());
        assert!(!lib.delete_user(99).await.unwrap());

        let id = lib.add_book("1984", "George Orwell", None, None, 2).await.unwrap();
        assert!(lib
            .update_book(id, "1984", "George Orwell", None, Some("Dystopia"), 2)
            .await
            .unwrap());
        assert!(lib.delete_book(id).await.unwrap());
        assert!(lib.get_book(id).await.unwrap().is_none());
    }

    #[actix_web::test]
    async fn shrinking_total_copies_clamps_availability() {
        let lib = fresh().await;

        let user = lib.add_user("Alice", None, None, None).await.unwrap();
        let book = lib.add_book("Emma", "Jane Austen", None, None, 5).await.unwrap();
        lib.create_loan(user, book, 14).await.unwrap();

        // 4 of 5 on the shelf; shrinking the edition to 2 clamps to 2.
        assert!(lib.update_book(book, "Emma", "Jane Austen", None, None, 2).await.unwrap());
        let updated = lib.get_book(book).await.unwrap().unwrap();
        assert_eq!(updated.total_copies, 2);
        assert_eq!(updated.available_copies, 2);
    }

    #[actix_web::test]
    async fn create_loan_decrements_and_sets_due_date() {
        let lib = fresh().await;

        let user = lib.add_user("Bob", Some("bob@example.com"), None, None).await.unwrap();
        let book = lib.add_book("Ulysses", "James Joyce", None, None, 2).await.unwrap();

        let loan_id = lib.create_loan(user, book, 14).await.unwrap();

        let loan = lib.get_loan(loan_id).await.unwrap().unwrap();
        assert_eq!(loan.user_id, user);
        assert_eq!(loan.book_id, book);
        assert_eq!(loan.status, "active");
        assert!(loan.return_date.is_none());
        assert_eq!(loan.due_date, loan.loan_date + Duration::days(14));

        let remaining = lib.get_book(book).await.unwrap().unwrap();
        assert_eq!(remaining.available_copies, 1);
    }

    #[actix_web::test]
    async fn create_loan_refuses_depleted_book() {
        let lib = fresh().await;

        let user = lib.add_user("Carol", None, None, None).await.unwrap();
        let book = lib.add_book("Sparse", "One Copy", None, None, 1).await.unwrap();

        lib.create_loan(user, book, 7).await.unwrap();
        assert!(lib.create_loan(user, book, 7).await.is_err());

        let depleted = lib.get_book(book).await.unwrap().unwrap();
        assert_eq!(depleted.available_copies, 0);
        assert_eq!(lib.list_active_loans().await.unwrap().len(), 1);
    }

    #[actix_web::test]
    async fn create_loan_rolls_back_on_unknown_user() {
        let lib = fresh().await;

        let book = lib.add_book("Walden", "Thoreau", None, None, 1).await.unwrap();
        assert!(lib.create_loan(404, book, 14).await.is_err());

        let untouched = lib.get_book(book).await.unwrap().unwrap();
        assert_eq!(untouched.available_copies, 1);
        assert!(lib.list_loans().await.unwrap().is_empty());
    }

    #[actix_web::test]
    async fn return_book_restores_availability_exactly_once() {
        let lib = fresh().await;

        let user = lib.add_user("Dave", None, None, None).await.unwrap();
        let book = lib.add_book("Ficciones", "Borges", None, None, 1).await.unwrap();
        let loan_id = lib.create_loan(user, book, 14).await.unwrap();

        assert!(lib.return_book(loan_id).await.unwrap());

        let loan = lib.get_loan(loan_id).await.unwrap().unwrap();
        assert_eq!(loan.status, "returned");
        assert!(loan.return_date.is_some());
        let book_row = lib.get_book(book).await.unwrap().unwrap();
        assert_eq!(book_row.available_copies, 1);

        // Second return is a no-op, not a double increment.
        assert!(!lib.return_book(loan_id).await.unwrap());
        let book_row = lib.get_book(book).await.unwrap().unwrap();
        assert_eq!(book_row.available_copies, 1);

        assert!(!lib.return_book(404).await.unwrap());
    }

    #[actix_web::test]
    async fn search_books_matches_title_author_and_isbn() {
        let lib = fresh().await;

        lib.add_book("The Silmarillion", "J.R.R. Tolkien", Some("9780261102736"), None, 1)
            .await
            .unwrap();
        lib.add_book("The Hobbit", "J.R.R. Tolkien", Some("9780261103344"), None, 1)
            .await
            .unwrap();
        lib.add_book("Dune", "Frank Herbert", Some("9780441013593"), None, 1)
            .await
            .unwrap();

        let by_author = lib.search_books("Tolkien").await.unwrap();
        let titles: Vec<_> = by_author.iter().map(|b| b.title.as_str()).collect();
        assert_eq!(titles, ["The Hobbit", "The Silmarillion"]);

        let by_isbn = lib.search_books("0441013593").await.unwrap();
        assert_eq!(by_isbn.len(), 1);
        assert_eq!(by_isbn[0].title, "Dune");

        assert!(lib.search_books("Pratchett").await.unwrap().is_empty());
    }

    #[actix_web::test]
    async fn users_round_trip_and_search() {
        let lib = fresh().await;

        let id = lib
            .add_user("Erin", Some("erin@example.com"), Some("555-0101"), Some("12 Elm St"))
            .await
            .unwrap();
        lib.add_user("Adam", Some("adam@example.com"), None, None).await.unwrap();

        let erin = lib.get_user(id).await.unwrap().unwrap();
        assert_eq!(erin.name, "Erin");
        assert_eq!(erin.email.as_deref(), Some("erin@example.com"));
        assert_eq!(erin.phone.as_deref(), Some("555-0101"));

        let all = lib.list_users().await.unwrap();
        let names: Vec<_> = all.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, ["Adam", "Erin"]);

        let dup = lib.add_user("Erin Again", Some("erin@example.com"), None, None).await;
        assert!(dup.is_err());

        let hits = lib.search_users("erin@").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
    }

    #[actix_web::test]
    async fn loan_listings_join_and_order() {
        let lib = fresh().await;

        let user = lib.add_user("Fay", None, None, None).await.unwrap();
        let short = lib.add_book("Soon Due", "A", None, None, 1).await.unwrap();
        let long = lib.add_book("Later Due", "B", None, None, 1).await.unwrap();

        let first = lib.create_loan(user, long, 21).await.unwrap();
        let second = lib.create_loan(user, short, 3).await.unwrap();

        let all = lib.list_loans().await.unwrap();
        assert_eq!(all.len(), 2);
        // Newest first.
        assert_eq!(all[0].id, second);
        assert_eq!(all[0].user_name, "Fay");
        assert_eq!(all[0].book_title, "Soon Due");

        // Soonest due first.
        let active = lib.list_active_loans().await.unwrap();
        assert_eq!(active[0].id, second);
        assert_eq!(active[1].id, first);

        lib.return_book(second).await.unwrap();
        let active = lib.list_active_loans().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, first);
    }

    #[actix_web::test]
    async fn deleting_a_book_leaves_its_loans_dangling() {
        let lib = fresh().await;

        let user = lib.add_user("Gus", None, None, None).await.unwrap();
        let book = lib.add_book("Doomed", "C", None, None, 1).await.unwrap();
        let loan_id = lib.create_loan(user, book, 14).await.unwrap();

        assert!(lib.delete_book(book).await.unwrap());
        let loan = lib.get_loan(loan_id).await.unwrap().unwrap();
        assert_eq!(loan.book_id, book);
        assert_eq!(loan.status, "active");
        // The joined listing drops the orphan, the raw row survives.
        assert!(lib.list_loans().await.unwrap().is_empty());
    }

    #[actix_web::test]
    async fn most_borrowed_ranks_by_loan_count() {
        let lib = fresh().await;

        let user = lib.add_user("Hal", None, None, None).await.unwrap();
        let popular = lib.add_book("Popular", "P", None, None, 10).await.unwrap();
        let middling = lib.add_book("Middling", "M", None, None, 10).await.unwrap();
        let shelved = lib.add_book("Shelved", "S", None, None, 10).await.unwrap();

        for _ in 0..5 {
            let loan = lib.create_loan(user, popular, 14).await.unwrap();
            lib.return_book(loan).await.unwrap();
        }
        for _ in 0..3 {
            let loan = lib.create_loan(user, middling, 14).await.unwrap();
            lib.return_book(loan).await.unwrap();
        }

        let top = lib.most_borrowed_books(2).await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!((top[0].id, top[0].borrow_count), (popular, 5));
        assert_eq!((top[1].id, top[1].borrow_count), (middling, 3));

        // Zero-loan books still show up with a count of 0.
        let full = lib.most_borrowed_books(10).await.unwrap();
        assert_eq!(full.len(), 3);
        assert_eq!((full[2].id, full[2].borrow_count), (shelved, 0));
    }
}
