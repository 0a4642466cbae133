use crate::calc::MarkDefaults;
use crate::db;
use crate::error::{EngineError, Result};
use crate::fees::FeeAllocation;
use rusqlite::Connection;
use serde_json::json;

pub const LOG_ENV: &str = "SCHOOLD_LOG";
pub const DEFAULT_LOG_FILTER: &str = "info";

const KEY_DEFAULT_MAX_MARKS: &str = "engine.default_max_marks";
const KEY_FEE_ALLOCATION: &str = "engine.fee_allocation";

/// Log filter: `SCHOOLD_LOG`, then `RUST_LOG`, then `info`.
pub fn log_filter() -> String {
    std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    /// Applied to results captured without max marks. None means such
    /// rows are rejected.
    pub default_max_marks: Option<f64>,
    pub fee_allocation: FeeAllocation,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_marks: None,
            fee_allocation: FeeAllocation::Global,
        }
    }
}

impl EngineConfig {
    pub fn load(conn: &Connection) -> Result<Self> {
        let mut cfg = EngineConfig::default();
        if let Some(v) = db::settings_get_json(conn, KEY_DEFAULT_MAX_MARKS)? {
            cfg.default_max_marks = v.as_f64().filter(|m| m.is_finite() && *m > 0.0);
        }
        if let Some(v) = db::settings_get_json(conn, KEY_FEE_ALLOCATION)? {
            if let Some(p) = v.as_str().and_then(FeeAllocation::parse) {
                cfg.fee_allocation = p;
            }
        }
        Ok(cfg)
    }

    pub fn save(&self, conn: &Connection) -> Result<()> {
        db::settings_set_json(conn, KEY_DEFAULT_MAX_MARKS, &json!(self.default_max_marks))?;
        db::settings_set_json(
            conn,
            KEY_FEE_ALLOCATION,
            &json!(self.fee_allocation.as_str()),
        )?;
        Ok(())
    }

    /// Applies a `settings.update` patch. Unknown keys are ignored; a
    /// present key with a bad value is an error.
    pub fn apply_patch(&mut self, patch: &serde_json::Value) -> Result<()> {
        if let Some(v) = patch.get("defaultMaxMarks") {
            self.default_max_marks = if v.is_null() {
                None
            } else {
                match v.as_f64() {
                    Some(m) if m.is_finite() && m > 0.0 => Some(m),
                    _ => {
                        return Err(EngineError::input(
                            "defaultMaxMarks must be a positive number or null",
                        ))
                    }
                }
            };
        }
        if let Some(v) = patch.get("feeAllocation") {
            self.fee_allocation = v
                .as_str()
                .and_then(FeeAllocation::parse)
                .ok_or_else(|| {
                    EngineError::input("feeAllocation must be one of: global, per_fee")
                })?;
        }
        Ok(())
    }

    pub fn mark_defaults(&self) -> MarkDefaults {
        MarkDefaults {
            default_max_marks: self.default_max_marks,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "defaultMaxMarks": self.default_max_marks,
            "feeAllocation": self.fee_allocation.as_str(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_validates_values() {
        let mut cfg = EngineConfig::default();
        cfg.apply_patch(&json!({ "defaultMaxMarks": 100, "feeAllocation": "per_fee" }))
            .expect("patch");
        assert_eq!(cfg.default_max_marks, Some(100.0));
        assert_eq!(cfg.fee_allocation, FeeAllocation::PerFee);

        cfg.apply_patch(&json!({ "defaultMaxMarks": null })).expect("clear");
        assert_eq!(cfg.default_max_marks, None);

        assert!(cfg.apply_patch(&json!({ "defaultMaxMarks": -5 })).is_err());
        assert!(cfg.apply_patch(&json!({ "feeAllocation": "split" })).is_err());
    }
}
