use crate::database::entities::{group_sub_groups, groups};
use crate::database::{DatabaseError, DatabaseResult};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
};

/// Groups DAO. Reads serve the group manager's cache fills; writes come from
/// the admin surface.
pub struct GroupsDao {
    db: DatabaseConnection,
}

impl GroupsDao {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn list(&self) -> DatabaseResult<Vec<groups::Model>> {
        Ok(groups::Entity::find()
            .order_by_asc(groups::Column::Sort)
            .order_by_desc(groups::Column::Id)
            .all(&self.db)
            .await?)
    }

    pub async fn find_by_id(&self, id: i32) -> DatabaseResult<Option<groups::Model>> {
        Ok(groups::Entity::find_by_id(id).one(&self.db).await?)
    }

    pub async fn find_by_name(&self, name: &str) -> DatabaseResult<Option<groups::Model>> {
        Ok(groups::Entity::find()
            .filter(groups::Column::Name.eq(name))
            .one(&self.db)
            .await?)
    }

    pub async fn insert(&self, model: groups::ActiveModel) -> DatabaseResult<groups::Model> {
        model.insert(&self.db).await.map_err(|e| {
            if crate::database::is_unique_violation(&e) {
                DatabaseError::Constraint("group name already exists".into())
            } else {
                e.into()
            }
        })
    }

    pub async fn update(&self, model: groups::ActiveModel) -> DatabaseResult<groups::Model> {
        Ok(model.update(&self.db).await?)
    }

    pub async fn sub_groups(&self, group_id: i32) -> DatabaseResult<Vec<group_sub_groups::Model>> {
        Ok(group_sub_groups::Entity::find()
            .filter(group_sub_groups::Column::GroupId.eq(group_id))
            .all(&self.db)
            .await?)
    }

    /// Number of aggregate groups referencing `sub_group_id` as a child.
    pub async fn count_parents_using(&self, sub_group_id: i32) -> DatabaseResult<u64> {
        Ok(group_sub_groups::Entity::find()
            .filter(group_sub_groups::Column::SubGroupId.eq(sub_group_id))
            .count(&self.db)
            .await?)
    }

    /// Replace the sub-group edge set of an aggregate group.
    pub async fn replace_sub_groups<C: ConnectionTrait>(
        conn: &C,
        group_id: i32,
        edges: &[(i32, i32)],
    ) -> DatabaseResult<()> {
        group_sub_groups::Entity::delete_many()
            .filter(group_sub_groups::Column::GroupId.eq(group_id))
            .exec(conn)
            .await?;
        for (sub_group_id, weight) in edges {
            let edge = group_sub_groups::ActiveModel {
                group_id: Set(group_id),
                sub_group_id: Set(*sub_group_id),
                weight: Set(*weight),
                ..Default::default()
            };
            edge.insert(conn).await?;
        }
        Ok(())
    }

    /// Delete a group with its edges and keys. Runs on the caller's
    /// transaction so KV cleanup failures can still roll everything back.
    pub async fn delete_cascade<C: ConnectionTrait>(conn: &C, group_id: i32) -> DatabaseResult<()> {
        use crate::database::entities::api_keys;

        group_sub_groups::Entity::delete_many()
            .filter(
                sea_orm::Condition::any()
                    .add(group_sub_groups::Column::GroupId.eq(group_id))
                    .add(group_sub_groups::Column::SubGroupId.eq(group_id)),
            )
            .exec(conn)
            .await?;
        api_keys::Entity::delete_many()
            .filter(api_keys::Column::GroupId.eq(group_id))
            .exec(conn)
            .await?;
        let res = groups::Entity::delete_by_id(group_id).exec(conn).await?;
        if res.rows_affected == 0 {
            return Err(DatabaseError::NotFound);
        }
        Ok(())
    }
}
