// Database interaction module. One DuckDB connection, owned by the
// recorder for the life of the process. Rows go in through the Arrow
// appender, one single-row batch per reading.

use anyhow::Result;
use chrono::DateTime;
use duckdb::arrow::array::{Float64Array, StringArray, TimestampMicrosecondArray};
use duckdb::arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use duckdb::arrow::record_batch::RecordBatch;
use duckdb::{Connection, params};
use std::sync::Arc;

use crate::config::WriteMode;
use crate::reading::Reading;

pub struct Store {
    conn: Connection,
    table: String,
    mode: WriteMode,
}

impl Store {
    /// Open the database and make sure the table exists.
    /// If `path` is `Some`, opens that file, otherwise uses an in-memory DB.
    pub fn open(path: Option<&str>, table: &str, mode: WriteMode) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)?,
            None => Connection::open_in_memory()?,
        };
        create_table(&conn, table)?;

        Ok(Store {
            conn,
            table: table.to_string(),
            mode,
        })
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    /// Write one reading. In upsert mode the previous row for the topic is
    /// replaced in the same transaction.
    pub fn write(&mut self, reading: &Reading) -> Result<()> {
        let batch = create_arrow_record_batch(std::slice::from_ref(reading))?;

        match self.mode {
            WriteMode::Insert => {
                let mut appender = self.conn.appender(&self.table)?;
                appender.append_record_batch(batch)?;
                appender.flush()?;
            }
            WriteMode::Upsert => {
                let tx = self.conn.transaction()?;
                tx.execute(
                    &format!("DELETE FROM {} WHERE topic = ?", self.table),
                    params![reading.topic],
                )?;
                {
                    let mut appender = tx.appender(&self.table)?;
                    appender.append_record_batch(batch)?;
                    appender.flush()?;
                }
                tx.commit()?;
            }
        }
        Ok(())
    }

    /// All stored readings in insertion order.
    pub fn readings(&self) -> Result<Vec<Reading>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT topic, epoch_us(\"timestamp\"), value FROM {} ORDER BY rowid",
            self.table
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (topic, micros, value) = row?;
            let timestamp = DateTime::from_timestamp_micros(micros)
                .ok_or_else(|| anyhow::anyhow!("timestamp out of range: {}", micros))?;
            out.push(Reading { topic, timestamp, value });
        }
        Ok(out)
    }

    pub fn count(&self) -> Result<u64> {
        let n: i64 = self.conn.query_row(
            &format!("SELECT count(*) FROM {}", self.table),
            [],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

pub fn create_table(conn: &Connection, table: &str) -> Result<()> {
    let create_table_sql = format!(
        "CREATE TABLE IF NOT EXISTS {} (
            topic VARCHAR NOT NULL,
            timestamp TIMESTAMP NOT NULL,
            value DOUBLE NOT NULL
        )",
        table
    );

    conn.execute(&create_table_sql, [])?;
    Ok(())
}

fn create_arrow_record_batch(rows: &[Reading]) -> Result<RecordBatch> {
    let topic_arr =
        StringArray::from(rows.iter().map(|r| r.topic.clone()).collect::<Vec<String>>());
    let ts_arr = TimestampMicrosecondArray::from(
        rows.iter().map(|r| r.timestamp.timestamp_micros()).collect::<Vec<i64>>(),
    );
    let value_arr = Float64Array::from(rows.iter().map(|r| r.value).collect::<Vec<f64>>());

    // Column order has to match the table definition above.
    let schema = Arc::new(Schema::new(vec![
        Field::new("topic", DataType::Utf8, false),
        Field::new("timestamp", DataType::Timestamp(TimeUnit::Microsecond, None), false),
        Field::new("value", DataType::Float64, false),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![Arc::new(topic_arr), Arc::new(ts_arr), Arc::new(value_arr)],
    )?;

    Ok(batch)
}
