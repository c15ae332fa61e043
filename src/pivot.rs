use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::NaiveDateTime;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::db::{Db, VALUE_COLUMNS};
use crate::domain::{ModelRunId, StationName, format_time};
use crate::error::SurgeError;
use crate::registry::Registry;

/// One wide-format output row: a time stamp plus one field per requested
/// category, null where the category has no value at that time.
#[derive(Debug, Clone, Serialize)]
pub struct PivotRow {
    pub time_stamp: String,
    #[serde(flatten)]
    pub columns: Map<String, Value>,
}

/// Caller-supplied category names become output column identifiers, so they
/// are allow-listed before anything touches the database. Composite names
/// collapse their dot-separated parts ("gfsforecast.ec95d" becomes
/// "gfsforecastec95d") and lowercase.
pub fn sanitize_category(name: &str) -> Result<String, SurgeError> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.]+$").unwrap());
    if !pattern.is_match(name) {
        return Err(SurgeError::InvalidSourceName(name.to_string()));
    }
    Ok(name.split('.').collect::<Vec<_>>().concat().to_lowercase())
}

#[derive(Debug, Clone)]
struct ColumnSpec {
    /// Raw category, matched exactly against source.data_source.
    category: String,
    label: String,
}

fn coalesce(values: [Option<f64>; VALUE_COLUMNS.len()]) -> Option<f64> {
    values.into_iter().flatten().next()
}

/// Reshapes narrow (time, source, value) rows into one wide row per time
/// stamp. The reshape happens entirely in application code over a fixed
/// category map; caller input is never spliced into SQL text.
pub struct PivotEngine<'a> {
    db: &'a Db,
}

impl<'a> PivotEngine<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    /// Observation pivot over an inclusive time window, optionally merged
    /// with one nowcast model category. Output columns follow the request
    /// order, each category exactly once; a time present for only one
    /// category still yields a row, with the other columns null.
    pub fn obs_series(
        &self,
        station: &StationName,
        start: NaiveDateTime,
        end: NaiveDateTime,
        categories: &[String],
        nowcast: Option<&str>,
    ) -> Result<Vec<PivotRow>, SurgeError> {
        // Every requested name is validated before anything touches the
        // database.
        let mut sanitized_names = Vec::with_capacity(categories.len());
        for category in categories {
            sanitized_names.push(sanitize_category(category)?);
        }
        let nowcast_spec = match nowcast {
            Some(category) => Some(ColumnSpec {
                category: category.to_string(),
                label: sanitize_category(category)?,
            }),
            None => None,
        };

        let registry = Registry::new(self.db);
        let mut specs: Vec<ColumnSpec> = Vec::new();
        let mut seen = Vec::new();
        for (category, sanitized) in categories.iter().zip(sanitized_names) {
            if seen.contains(&sanitized) {
                continue;
            }
            seen.push(sanitized.clone());
            // Observation columns carry the source's variable name; a
            // category with no registered source keeps its bare name and
            // pivots to all nulls.
            let label = match registry.variable_for_data_source(category)? {
                Some(variable) if !sanitized.ends_with(&variable) => {
                    format!("{sanitized}_{variable}")
                }
                _ => sanitized,
            };
            specs.push(ColumnSpec {
                category: category.clone(),
                label,
            });
        }

        if specs.is_empty() && nowcast_spec.is_none() {
            return Ok(Vec::new());
        }

        let start = format_time(&start);
        let end = format_time(&end);
        let mut table: BTreeMap<String, Vec<Option<f64>>> = BTreeMap::new();
        let width = specs.len() + nowcast_spec.iter().count();

        if !specs.is_empty() {
            let placeholders = (0..specs.len())
                .map(|i| format!("?{}", i + 4))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT s.data_source, d.time, {values}
                 FROM obs_data d
                 JOIN source s ON s.source_id = d.source_id
                 JOIN station g ON g.station_id = d.station_id
                 WHERE g.station_name = ?1 AND d.time >= ?2 AND d.time <= ?3
                   AND s.data_source IN ({placeholders})
                 ORDER BY d.time",
                values = prefixed_value_columns()
            );
            let mut params: Vec<&str> = vec![station.as_str(), &start, &end];
            params.extend(specs.iter().map(|spec| spec.category.as_str()));
            self.fill(&sql, &params, &specs, 0, width, &mut table)?;
        }

        if let Some(spec) = &nowcast_spec {
            // Successive nowcast cycles overlap in time; ordering by timemark
            // lets the freshest cycle win each slot.
            let sql = format!(
                "SELECT s.data_source, d.time, {values}
                 FROM model_data d
                 JOIN source s ON s.source_id = d.source_id
                 JOIN station g ON g.station_id = d.station_id
                 WHERE g.station_name = ?1 AND d.time >= ?2 AND d.time <= ?3
                   AND s.data_source = ?4
                 ORDER BY d.timemark, d.time",
                values = prefixed_value_columns()
            );
            let params: Vec<&str> = vec![station.as_str(), &start, &end, &spec.category];
            self.fill(
                &sql,
                &params,
                std::slice::from_ref(spec),
                specs.len(),
                width,
                &mut table,
            )?;
        }

        let mut labels: Vec<String> = specs.into_iter().map(|spec| spec.label).collect();
        if let Some(spec) = nowcast_spec {
            labels.push(spec.label);
        }
        Ok(rows_from_table(table, &labels))
    }

    /// Forecast pivot for one model run: exact timemark and run match, so
    /// concurrently active runs never collide on shared time stamps.
    pub fn forecast_series(
        &self,
        station: &StationName,
        run: &ModelRunId,
        category: &str,
    ) -> Result<Vec<PivotRow>, SurgeError> {
        let spec = ColumnSpec {
            category: category.to_string(),
            label: sanitize_category(category)?,
        };

        let sql = format!(
            "SELECT s.data_source, d.time, {values}
             FROM model_data d
             JOIN source s ON s.source_id = d.source_id
             JOIN station g ON g.station_id = d.station_id
             WHERE g.station_name = ?1 AND d.timemark = ?2 AND d.model_run_id = ?3
               AND s.data_source = ?4
             ORDER BY d.time",
            values = prefixed_value_columns()
        );
        let timemark = run.timemark().to_string();
        let run_id = run.to_string();
        let params: Vec<&str> = vec![station.as_str(), &timemark, &run_id, &spec.category];

        let mut table: BTreeMap<String, Vec<Option<f64>>> = BTreeMap::new();
        self.fill(&sql, &params, std::slice::from_ref(&spec), 0, 1, &mut table)?;
        Ok(rows_from_table(table, &[spec.label]))
    }

    fn fill(
        &self,
        sql: &str,
        params: &[&str],
        specs: &[ColumnSpec],
        offset: usize,
        width: usize,
        table: &mut BTreeMap<String, Vec<Option<f64>>>,
    ) -> Result<(), SurgeError> {
        let mut statement = self.db.conn().prepare(sql)?;
        let mut rows = statement.query(rusqlite::params_from_iter(params))?;
        while let Some(row) = rows.next()? {
            let data_source: String = row.get(0)?;
            let time: String = row.get(1)?;
            let mut values = [None; VALUE_COLUMNS.len()];
            for (slot, value) in values.iter_mut().enumerate() {
                *value = row.get(2 + slot)?;
            }
            let Some(index) = specs.iter().position(|spec| spec.category == data_source) else {
                continue;
            };
            let slots = table.entry(time).or_insert_with(|| vec![None; width]);
            if let Some(value) = coalesce(values) {
                slots[offset + index] = Some(value);
            }
        }
        Ok(())
    }
}

fn prefixed_value_columns() -> String {
    VALUE_COLUMNS
        .iter()
        .map(|column| format!("d.{column}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn rows_from_table(
    table: BTreeMap<String, Vec<Option<f64>>>,
    labels: &[String],
) -> Vec<PivotRow> {
    table
        .into_iter()
        .map(|(time_stamp, slots)| {
            let mut columns = Map::new();
            for (label, value) in labels.iter().zip(slots) {
                let value = value
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null);
                columns.insert(label.clone(), value);
            }
            PivotRow { time_stamp, columns }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn sanitize_collapses_composite_names() {
        assert_eq!(
            sanitize_category("gfsforecast.ec95d").unwrap(),
            "gfsforecastec95d"
        );
        assert_eq!(sanitize_category("tidal_gauge").unwrap(), "tidal_gauge");
        assert_eq!(
            sanitize_category("NAMFORECAST_SAB_V1.23").unwrap(),
            "namforecast_sab_v123"
        );
    }

    #[test]
    fn sanitize_rejects_unsafe_names() {
        for name in ["water level", "a;b", "x'--", "", "col\"umn"] {
            assert_matches!(
                sanitize_category(name).unwrap_err(),
                SurgeError::InvalidSourceName(_)
            );
        }
    }

    #[test]
    fn coalesce_takes_first_non_null() {
        assert_eq!(coalesce([None, Some(2.0), Some(3.0), None, None]), Some(2.0));
        assert_eq!(coalesce([None, None, None, None, None]), None);
    }
}
