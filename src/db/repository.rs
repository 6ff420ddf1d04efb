//! Row helpers for the `users` / `orders` schema.
//!
//! Every helper goes through the pool's tracked acquisition, so its connections
//! show up in [`PoolStats`](crate::db::PoolStats) like any other client's. SQL is
//! written with `?` placeholders and rebound for the target dialect.

use crate::db::pool::ConnectionPool;
use crate::error::{DbError, DbResult};
use crate::models::{Order, QueryParam, Statement, User};
use tracing::debug;

const USER_COLUMNS: &str = "id, username, email, created_at, updated_at";
const ORDER_COLUMNS: &str =
    "id, user_id, product_name, quantity, price, status, created_at, updated_at";

/// An order to insert. `status` defaults to `pending` in the schema.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub user_id: i64,
    pub product_name: String,
    pub quantity: i64,
    pub price: f64,
}

pub struct Repository<'a> {
    pool: &'a ConnectionPool,
}

impl<'a> Repository<'a> {
    pub fn new(pool: &'a ConnectionPool) -> Self {
        Self { pool }
    }

    pub async fn all_users(&self) -> DbResult<Vec<User>> {
        let statement = self.statement(
            &format!("SELECT {USER_COLUMNS} FROM users ORDER BY id"),
            Vec::new(),
        );
        self.pool.fetch_all(&statement).await
    }

    /// Returns [`DbError::NotFound`] when no user has `id`.
    pub async fn user_by_id(&self, id: i64) -> DbResult<User> {
        let statement = self.statement(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"),
            vec![QueryParam::Int(id)],
        );
        self.pool
            .fetch_all::<User>(&statement)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DbError::not_found(format!("user with id {id} not found")))
    }

    /// Orders for `user_id`, newest first.
    pub async fn orders_for_user(&self, user_id: i64) -> DbResult<Vec<Order>> {
        let statement = self.statement(
            &format!(
                "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = ? \
                 ORDER BY created_at DESC, id DESC"
            ),
            vec![QueryParam::Int(user_id)],
        );
        self.pool.fetch_all(&statement).await
    }

    pub async fn create_user(&self, username: &str, email: &str) -> DbResult<()> {
        let statement = self.statement(
            "INSERT INTO users (username, email) VALUES (?, ?)",
            vec![username.into(), email.into()],
        );
        let affected = self.pool.execute(&statement).await?;
        debug!(username, affected, "Created user");
        Ok(())
    }

    /// Insert an order. Fails with [`DbError::Query`] when `user_id` has no user.
    pub async fn create_order(&self, order: &NewOrder) -> DbResult<()> {
        let statement = self.statement(
            "INSERT INTO orders (user_id, product_name, quantity, price) VALUES (?, ?, ?, ?)",
            vec![
                QueryParam::Int(order.user_id),
                order.product_name.as_str().into(),
                QueryParam::Int(order.quantity),
                QueryParam::Float(order.price),
            ],
        );
        self.pool.execute(&statement).await?;
        debug!(user_id = order.user_id, product = %order.product_name, "Created order");
        Ok(())
    }

    fn statement(&self, sql: &str, params: Vec<QueryParam>) -> Statement {
        let mut statement = Statement::new(self.pool.db_type().rebind(sql));
        statement.params = params;
        statement
    }
}
