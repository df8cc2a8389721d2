//! Class catalog storage

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use sqlx::prelude::Type;
use thiserror::Error;
use uuid::Uuid;

use crate::model::users::UserId;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Invalid class id format")]
    InvalidClassId,
}

/// Newtype for class id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Type, Serialize, Deserialize)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct ClassId(Uuid);

impl std::fmt::Display for ClassId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ClassId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Uuid::parse_str(s).map_err(|_| Error::InvalidClassId)?;
        Ok(Self(id))
    }
}

/// A bookable class offering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Class {
    pub id: ClassId,
    pub teacher_id: UserId,
    pub title: String,
    pub discipline: String,
    pub description: String,
    pub starts_at: DateTime<Utc>,
    pub duration_min: u32,
    pub capacity: u32,
    pub price_cents: i64,
}

/// Fields a teacher submits when creating or updating a class
#[derive(Debug, Clone, Deserialize)]
pub struct ClassFields {
    pub title: String,
    pub discipline: String,
    pub description: String,
    pub starts_at: DateTime<Utc>,
    pub duration_min: u32,
    pub capacity: u32,
    pub price_cents: i64,
}

/// Catalog listing filters; empty filters list everything
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClassFilter {
    pub discipline: Option<String>,
    pub teacher: Option<UserId>,
}

impl Class {
    /// Creates a class owned by the teacher
    pub async fn create(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        teacher_id: UserId,
        fields: ClassFields,
    ) -> Result<Self> {
        let class = Self {
            id: ClassId(Uuid::new_v4()),
            teacher_id,
            title: fields.title,
            discipline: fields.discipline,
            description: fields.description,
            starts_at: fields.starts_at,
            duration_min: fields.duration_min,
            capacity: fields.capacity,
            price_cents: fields.price_cents,
        };

        sqlx::query(
            "insert into classes (id, teacher_id, title, discipline, description, starts_at, \
             duration_min, capacity, price_cents) values (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(class.id)
        .bind(class.teacher_id)
        .bind(&class.title)
        .bind(&class.discipline)
        .bind(&class.description)
        .bind(class.starts_at)
        .bind(class.duration_min)
        .bind(class.capacity)
        .bind(class.price_cents)
        .execute(db)
        .await?;

        Ok(class)
    }

    /// Fetches a single class by id
    pub async fn fetch(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        id: ClassId,
    ) -> Result<Option<Self>> {
        let row: Option<ClassRow> = sqlx::query_as(
            "select id, teacher_id, title, discipline, description, starts_at, duration_min, \
             capacity, price_cents from classes where id = ?",
        )
        .bind(id)
        .fetch_optional(db)
        .await?;

        Ok(row.map(Into::into))
    }

    /// Lists classes matching the filter, soonest first
    pub async fn list(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        filter: &ClassFilter,
    ) -> Result<Vec<Self>> {
        let rows: Vec<ClassRow> = sqlx::query_as(
            "select id, teacher_id, title, discipline, description, starts_at, duration_min, \
             capacity, price_cents from classes \
             where (? is null or discipline = ?) and (? is null or teacher_id = ?) \
             order by starts_at",
        )
        .bind(&filter.discipline)
        .bind(&filter.discipline)
        .bind(filter.teacher)
        .bind(filter.teacher)
        .fetch_all(db)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Replaces the class fields. Returns false when the class does not
    /// exist or is not owned by `teacher_id`.
    pub async fn update(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        id: ClassId,
        teacher_id: UserId,
        fields: ClassFields,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "update classes set title = ?, discipline = ?, description = ?, starts_at = ?, \
             duration_min = ?, capacity = ?, price_cents = ? where id = ? and teacher_id = ?",
        )
        .bind(&fields.title)
        .bind(&fields.discipline)
        .bind(&fields.description)
        .bind(fields.starts_at)
        .bind(fields.duration_min)
        .bind(fields.capacity)
        .bind(fields.price_cents)
        .bind(id)
        .bind(teacher_id)
        .execute(db)
        .await?;

        Ok(updated.rows_affected() == 1)
    }

    /// Deletes the class. With `owner` set, only that teacher's class is
    /// removed; admins pass `None`.
    pub async fn delete(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        id: ClassId,
        owner: Option<UserId>,
    ) -> Result<bool> {
        let deleted = sqlx::query("delete from classes where id = ? and (? is null or teacher_id = ?)")
            .bind(id)
            .bind(owner)
            .bind(owner)
            .execute(db)
            .await?;

        Ok(deleted.rows_affected() == 1)
    }
}

type ClassRow = (
    ClassId,
    UserId,
    String,
    String,
    String,
    DateTime<Utc>,
    u32,
    u32,
    i64,
);

impl From<ClassRow> for Class {
    fn from(row: ClassRow) -> Self {
        let (id, teacher_id, title, discipline, description, starts_at, duration_min, capacity, price_cents) =
            row;
        Self {
            id,
            teacher_id,
            title,
            discipline,
            description,
            starts_at,
            duration_min,
            capacity,
            price_cents,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::users::NewUser;
    use session::Role;
    use sqlx::SqlitePool;

    async fn setup_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("model/migrations").run(&pool).await.unwrap();
        pool
    }

    async fn teacher(pool: &SqlitePool, email: &str) -> UserId {
        NewUser {
            name: "Ines Duarte".into(),
            email: email.into(),
            role: Role::Teacher,
            password: "pw".into(),
        }
        .create(pool)
        .await
        .unwrap()
    }

    fn fields(title: &str, discipline: &str) -> ClassFields {
        ClassFields {
            title: title.into(),
            discipline: discipline.into(),
            description: "A class".into(),
            starts_at: Utc::now() + chrono::Duration::days(1),
            duration_min: 60,
            capacity: 12,
            price_cents: 2500,
        }
    }

    #[tokio::test]
    async fn create_fetch_round_trip() {
        let pool = setup_pool().await;
        let teacher_id = teacher(&pool, "t@example.com").await;

        let class = Class::create(&pool, teacher_id, fields("Morning flow", "yoga"))
            .await
            .unwrap();
        let fetched = Class::fetch(&pool, class.id).await.unwrap().unwrap();

        assert_eq!(fetched, class);
        assert_eq!(
            Class::fetch(&pool, ClassId(Uuid::new_v4())).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn listing_filters_by_discipline_and_teacher() {
        let pool = setup_pool().await;
        let t1 = teacher(&pool, "t1@example.com").await;
        let t2 = teacher(&pool, "t2@example.com").await;

        Class::create(&pool, t1, fields("Morning flow", "yoga"))
            .await
            .unwrap();
        Class::create(&pool, t1, fields("Core basics", "pilates"))
            .await
            .unwrap();
        Class::create(&pool, t2, fields("Evening flow", "yoga"))
            .await
            .unwrap();

        let all = Class::list(&pool, &ClassFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);

        let yoga = Class::list(
            &pool,
            &ClassFilter {
                discipline: Some("yoga".into()),
                teacher: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(yoga.len(), 2);
        assert!(yoga.iter().all(|class| class.discipline == "yoga"));

        let t1_yoga = Class::list(
            &pool,
            &ClassFilter {
                discipline: Some("yoga".into()),
                teacher: Some(t1),
            },
        )
        .await
        .unwrap();
        assert_eq!(t1_yoga.len(), 1);
        assert_eq!(t1_yoga[0].title, "Morning flow");
    }

    #[tokio::test]
    async fn updates_are_owner_scoped() {
        let pool = setup_pool().await;
        let owner = teacher(&pool, "t1@example.com").await;
        let other = teacher(&pool, "t2@example.com").await;

        let class = Class::create(&pool, owner, fields("Morning flow", "yoga"))
            .await
            .unwrap();

        let foreign = Class::update(&pool, class.id, other, fields("Hijacked", "yoga"))
            .await
            .unwrap();
        assert!(!foreign);

        let own = Class::update(&pool, class.id, owner, fields("Sunrise flow", "yoga"))
            .await
            .unwrap();
        assert!(own);
        assert_eq!(
            Class::fetch(&pool, class.id).await.unwrap().unwrap().title,
            "Sunrise flow"
        );
    }

    #[tokio::test]
    async fn deletes_are_owner_scoped_unless_admin() {
        let pool = setup_pool().await;
        let owner = teacher(&pool, "t1@example.com").await;
        let other = teacher(&pool, "t2@example.com").await;

        let class = Class::create(&pool, owner, fields("Morning flow", "yoga"))
            .await
            .unwrap();

        assert!(!Class::delete(&pool, class.id, Some(other)).await.unwrap());
        assert!(Class::fetch(&pool, class.id).await.unwrap().is_some());

        // Admin path: no owner restriction
        assert!(Class::delete(&pool, class.id, None).await.unwrap());
        assert!(Class::fetch(&pool, class.id).await.unwrap().is_none());
    }
}
