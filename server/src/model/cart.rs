//! Per-student shopping cart

use color_eyre::Result;
use serde::Serialize;

use crate::model::catalog::ClassId;
use crate::model::users::UserId;

/// One cart line, joined with the class it points at
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CartItem {
    pub class_id: ClassId,
    pub title: String,
    pub unit_price_cents: i64,
    pub quantity: u32,
}

impl CartItem {
    pub fn subtotal_cents(&self) -> i64 {
        self.unit_price_cents * i64::from(self.quantity)
    }
}

/// Cart contents with the computed total
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cart {
    pub items: Vec<CartItem>,
    pub total_cents: i64,
}

impl Cart {
    /// Loads the user's cart
    pub async fn fetch(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        user_id: UserId,
    ) -> Result<Self> {
        let rows: Vec<(ClassId, String, i64, u32)> = sqlx::query_as(
            "select c.id, c.title, c.price_cents, i.quantity \
             from cart_items i join classes c on c.id = i.class_id \
             where i.user_id = ? order by c.starts_at",
        )
        .bind(user_id)
        .fetch_all(db)
        .await?;

        let items: Vec<CartItem> = rows
            .into_iter()
            .map(|(class_id, title, unit_price_cents, quantity)| CartItem {
                class_id,
                title,
                unit_price_cents,
                quantity,
            })
            .collect();
        let total_cents = items.iter().map(CartItem::subtotal_cents).sum();

        Ok(Self { items, total_cents })
    }

    /// Adds a class to the cart, or bumps its quantity when already there.
    /// Returns false when the class does not exist.
    pub async fn add(
        db: &sqlx::SqlitePool,
        user_id: UserId,
        class_id: ClassId,
        quantity: u32,
    ) -> Result<bool> {
        let exists: Option<(ClassId,)> = sqlx::query_as("select id from classes where id = ?")
            .bind(class_id)
            .fetch_optional(db)
            .await?;
        if exists.is_none() {
            return Ok(false);
        }

        sqlx::query(
            "insert into cart_items (user_id, class_id, quantity) values (?, ?, ?) \
             on conflict(user_id, class_id) do update set quantity = quantity + excluded.quantity",
        )
        .bind(user_id)
        .bind(class_id)
        .bind(quantity.max(1))
        .execute(db)
        .await?;

        Ok(true)
    }

    /// Drops one line from the cart. Missing lines are fine.
    pub async fn remove(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        user_id: UserId,
        class_id: ClassId,
    ) -> Result<()> {
        sqlx::query("delete from cart_items where user_id = ? and class_id = ?")
            .bind(user_id)
            .bind(class_id)
            .execute(db)
            .await?;
        Ok(())
    }

    /// Empties the user's cart
    pub async fn clear(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        user_id: UserId,
    ) -> Result<()> {
        sqlx::query("delete from cart_items where user_id = ?")
            .bind(user_id)
            .execute(db)
            .await?;
        Ok(())
    }
}
