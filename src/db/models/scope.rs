use crate::api::EmptyResult;
use crate::db::schema::{app_scopes, scopes};
use crate::db::DbConn;
use crate::error::MapResult;

#[derive(Identifiable, Queryable, Insertable)]
#[diesel(table_name = scopes)]
#[diesel(primary_key(name))]
pub struct Scope {
    pub name: String,
    pub description: String,
}

// Scopes an m2m application is permitted to request with client_credentials.
#[derive(Identifiable, Queryable, Insertable)]
#[diesel(table_name = app_scopes)]
#[diesel(primary_key(app_uuid, scope))]
pub struct AppScope {
    pub app_uuid: String,
    pub scope: String,
}

use diesel::prelude::*;

impl Scope {
    pub async fn find_all(conn: &mut DbConn) -> Vec<Self> {
        db_run! { conn: {
            scopes::table
                .order(scopes::name.asc())
                .load::<Self>(conn)
                .expect("Error loading scopes")
        }}
    }
}

impl AppScope {
    pub async fn grant(app_uuid: &str, scope: &str, conn: &mut DbConn) -> EmptyResult {
        let row = AppScope {
            app_uuid: app_uuid.to_string(),
            scope: scope.to_string(),
        };
        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(app_scopes::table)
                    .values(&row)
                    .execute(conn)
                    .map_res("Error granting scope")
            }
            postgresql {
                diesel::insert_into(app_scopes::table)
                    .values(&row)
                    .on_conflict((app_scopes::app_uuid, app_scopes::scope))
                    .do_nothing()
                    .execute(conn)
                    .map_res("Error granting scope")
            }
        }
    }

    pub async fn revoke(app_uuid: &str, scope: &str, conn: &mut DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::delete(
                app_scopes::table
                    .filter(app_scopes::app_uuid.eq(app_uuid))
                    .filter(app_scopes::scope.eq(scope)),
            )
            .execute(conn)
            .map_res("Error revoking scope")
        }}
    }

    pub async fn find_by_app(app_uuid: &str, conn: &mut DbConn) -> Vec<String> {
        db_run! { conn: {
            app_scopes::table
                .filter(app_scopes::app_uuid.eq(app_uuid))
                .select(app_scopes::scope)
                .load::<String>(conn)
                .expect("Error loading app scopes")
        }}
    }
}
