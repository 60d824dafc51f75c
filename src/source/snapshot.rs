//! Initial snapshot export
//!
//! Streams the existing contents of every published table through the same
//! change callbacks as live replication, as a single synthetic transaction
//! with xid 0. Runs on a second, non-replication connection pinned to the
//! snapshot the slot creation exported, so the copied data lines up exactly
//! with the WAL position at which streaming begins.

use crate::config::BridgeConfig;
use crate::errors::{BridgeError, BridgeResult};
use crate::source::ChangeHandler;
use crate::source::connection::{PgConnection, PgQueryResult};
use crate::source::parser::{ColumnSpec, RelationInfo, TupleData, TupleValue};
use crate::source::schema;
use crate::types::{Lsn, Oid};
use tracing::{debug, info};

pub fn stream_snapshot(
    config: &BridgeConfig,
    snapshot_name: &str,
    consistent_point: Lsn,
    handler: &mut dyn ChangeHandler,
) -> BridgeResult<()> {
    info!("capturing consistent snapshot \"{snapshot_name}\"");
    let conn = PgConnection::connect(&config.conninfo)?;
    conn.exec_ok("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")?;
    conn.exec_ok(&format!("SET TRANSACTION SNAPSHOT '{snapshot_name}'"))?;

    handler.on_begin(0, 0)?;

    let tables = published_tables(&conn, &config.publication)?;
    info!(
        "snapshotting {} table(s) from publication \"{}\"",
        tables.len(),
        config.publication
    );
    for table in &tables {
        export_table(&conn, table, handler)?;
    }

    handler.on_commit(0, consistent_point)?;
    conn.exec_ok("COMMIT")?;
    Ok(())
}

struct PublishedTable {
    relid: Oid,
    namespace: String,
    name: String,
    replica_identity: char,
}

fn published_tables(
    conn: &PgConnection,
    publication: &str,
) -> BridgeResult<Vec<PublishedTable>> {
    let sql = format!(
        "SELECT c.oid, pt.schemaname, pt.tablename, c.relreplident \
         FROM pg_publication_tables pt \
         JOIN pg_namespace n ON n.nspname = pt.schemaname \
         JOIN pg_class c ON c.relnamespace = n.oid AND c.relname = pt.tablename \
         WHERE pt.pubname = '{publication}' \
         ORDER BY pt.schemaname, pt.tablename"
    );
    let result = conn.exec_ok(&sql)?;

    let mut tables = Vec::with_capacity(result.ntuples() as usize);
    for row in 0..result.ntuples() {
        tables.push(PublishedTable {
            relid: parse_oid(&result, row, 0)?,
            namespace: result.getvalue(row, 1).unwrap_or_default(),
            name: result.getvalue(row, 2).unwrap_or_default(),
            replica_identity: result
                .getvalue(row, 3)
                .and_then(|s| s.chars().next())
                .unwrap_or('d'),
        });
    }
    Ok(tables)
}

fn relation_columns(conn: &PgConnection, relid: Oid) -> BridgeResult<Vec<ColumnSpec>> {
    let sql = format!(
        "SELECT a.attname, a.atttypid, a.atttypmod, \
                COALESCE(a.attnum = ANY(i.indkey::int2[]), false) \
         FROM pg_attribute a \
         LEFT JOIN pg_index i ON i.indrelid = a.attrelid AND i.indisprimary \
         WHERE a.attrelid = {relid} AND a.attnum > 0 AND NOT a.attisdropped \
         ORDER BY a.attnum"
    );
    let result = conn.exec_ok(&sql)?;

    let mut columns = Vec::with_capacity(result.ntuples() as usize);
    for row in 0..result.ntuples() {
        columns.push(ColumnSpec {
            name: result.getvalue(row, 0).unwrap_or_default(),
            type_oid: parse_oid(&result, row, 1)?,
            type_modifier: result
                .getvalue(row, 2)
                .and_then(|s| s.parse().ok())
                .unwrap_or(-1),
            is_key: result.getvalue(row, 3).as_deref() == Some("t"),
        });
    }
    Ok(columns)
}

fn export_table(
    conn: &PgConnection,
    table: &PublishedTable,
    handler: &mut dyn ChangeHandler,
) -> BridgeResult<()> {
    let rel = RelationInfo {
        relid: table.relid,
        namespace: table.namespace.clone(),
        name: table.name.clone(),
        replica_identity: table.replica_identity,
        columns: relation_columns(conn, table.relid)?,
    };

    let (key_schema, value_schema) = schema::generate_schemas(&rel);
    handler.on_table_schema(rel.relid, key_schema.as_deref(), &value_schema, 0)?;

    let rows = conn.exec_ok(&format!(
        "SELECT * FROM ONLY \"{}\".\"{}\"",
        table.namespace, table.name
    ))?;
    if rows.nfields() as usize != rel.columns.len() {
        return Err(BridgeError::protocol(format!(
            "snapshot of \"{}\".\"{}\" returned {} columns, catalog says {}",
            table.namespace,
            table.name,
            rows.nfields(),
            rel.columns.len()
        )));
    }

    for row in 0..rows.ntuples() {
        let tuple: TupleData = (0..rows.nfields())
            .map(|col| {
                if rows.is_null(row, col) {
                    TupleValue::Null
                } else {
                    TupleValue::Text(rows.getvalue(row, col).unwrap_or_default())
                }
            })
            .collect();

        let value = schema::row_to_json(&rel, &tuple)?;
        let key = schema::key_to_json(&rel, &tuple)?;
        handler.on_insert(rel.relid, key.as_deref(), &value, 0)?;
    }

    debug!(
        "snapshotted {} row(s) from \"{}\".\"{}\"",
        rows.ntuples(),
        table.namespace,
        table.name
    );
    Ok(())
}

fn parse_oid(result: &PgQueryResult, row: i32, col: i32) -> BridgeResult<Oid> {
    result
        .getvalue(row, col)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| BridgeError::protocol("unparseable oid in catalog query"))
}
