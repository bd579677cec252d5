//! Static catalogue of the loader pipelines and their table contracts.

use serde_json::{Map, Value as JsonValue};

use crate::{BusinessKey, FieldValue, LoaderError, ValueFields};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    BigInt,
    Numeric,
    Text,
    Boolean,
    Timestamptz,
    Date,
}

impl ColumnType {
    pub fn sql(self) -> &'static str {
        match self {
            ColumnType::BigInt => "BIGINT",
            ColumnType::Numeric => "NUMERIC",
            ColumnType::Text => "VARCHAR",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Timestamptz => "TIMESTAMPTZ",
            ColumnType::Date => "DATE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
}

const fn col(name: &'static str, ty: ColumnType) -> Column {
    Column { name, ty }
}

/// A latest-state business table: key columns form the primary key.
#[derive(Debug, Clone, Copy)]
pub struct EntitySchema {
    pub name: &'static str,
    pub key: &'static [Column],
    pub values: &'static [Column],
}

impl EntitySchema {
    pub fn table(&self) -> &'static str {
        self.name
    }

    pub fn value_column(&self, name: &str) -> Option<&Column> {
        self.values.iter().find(|c| c.name == name)
    }

    pub fn key_from_json(&self, obj: &Map<String, JsonValue>) -> Result<BusinessKey, LoaderError> {
        if let Some(extra) = obj.keys().find(|k| !self.key.iter().any(|c| c.name == k.as_str())) {
            return Err(LoaderError::invalid(self.name, format!("unknown key column {extra}")));
        }
        let mut parts = Vec::with_capacity(self.key.len());
        for column in self.key {
            let raw = obj
                .get(column.name)
                .ok_or_else(|| LoaderError::invalid(self.name, format!("missing key column {}", column.name)))?;
            let value = FieldValue::from_json(column.ty, raw)
                .map_err(|err| LoaderError::invalid(self.name, format!("key column {}: {err}", column.name)))?;
            parts.push(value);
        }
        let key = BusinessKey(parts);
        self.check_key(&key)?;
        Ok(key)
    }

    /// Absent value columns are stored as NULL; unknown ones are rejected.
    pub fn values_from_json(&self, obj: &Map<String, JsonValue>) -> Result<ValueFields, LoaderError> {
        if let Some(extra) = obj.keys().find(|k| self.value_column(k).is_none()) {
            return Err(LoaderError::invalid(self.name, format!("unknown value column {extra}")));
        }
        let mut values = ValueFields::new();
        for column in self.values {
            let value = match obj.get(column.name) {
                Some(raw) => FieldValue::from_json(column.ty, raw).map_err(|err| {
                    LoaderError::invalid(self.name, format!("value column {}: {err}", column.name))
                })?,
                None => FieldValue::Null,
            };
            values.insert(column.name, value);
        }
        Ok(values)
    }

    pub fn check_key(&self, key: &BusinessKey) -> Result<(), LoaderError> {
        if key.parts().len() != self.key.len() {
            return Err(LoaderError::invalid(
                self.name,
                format!("key has {} parts, expected {}", key.parts().len(), self.key.len()),
            ));
        }
        for (column, part) in self.key.iter().zip(key.parts()) {
            if part.is_null() {
                return Err(LoaderError::invalid(self.name, format!("key column {} is null", column.name)));
            }
            if !part.fits(column.ty) {
                return Err(LoaderError::invalid(
                    self.name,
                    format!("key column {} expects {:?}", column.name, column.ty),
                ));
            }
        }
        Ok(())
    }

    pub fn check_values(&self, values: &ValueFields) -> Result<(), LoaderError> {
        for (name, value) in values.iter() {
            let column = self
                .value_column(name)
                .ok_or_else(|| LoaderError::invalid(self.name, format!("unknown value column {name}")))?;
            if !value.fits(column.ty) {
                return Err(LoaderError::invalid(
                    self.name,
                    format!("value column {name} expects {:?}", column.ty),
                ));
            }
        }
        if let Some(missing) = self.values.iter().find(|c| values.get(c.name).is_none()) {
            return Err(LoaderError::invalid(self.name, format!("missing value column {}", missing.name)));
        }
        Ok(())
    }
}

/// Per-owner checkpoint table.
#[derive(Debug, Clone, Copy)]
pub struct ControlSchema {
    pub table: &'static str,
    pub owner_column: &'static str,
    pub timestamp_column: &'static str,
}

impl ControlSchema {
    pub fn values_for(&self, timestamp: chrono::DateTime<chrono::Utc>) -> ValueFields {
        ValueFields::new().with(self.timestamp_column, FieldValue::timestamp(timestamp))
    }

    pub fn key_columns(&self) -> [Column; 1] {
        [col(self.owner_column, ColumnType::BigInt)]
    }

    pub fn value_columns(&self) -> [Column; 1] {
        [col(self.timestamp_column, ColumnType::Timestamptz)]
    }
}

pub fn event_log_table(table: &str) -> String {
    format!("{table}_event_log")
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSchema {
    pub name: &'static str,
    pub entities: &'static [EntitySchema],
    pub control: ControlSchema,
}

impl PipelineSchema {
    pub fn entity(&self, name: &str) -> Option<&'static EntitySchema> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn watermark_table(&self) -> String {
        format!("loader_{}", self.name)
    }

    pub fn event_sequence(&self) -> String {
        format!("event_id_{}_seq", self.name)
    }

    /// Key and value columns of a business table or of the control table.
    pub fn table_columns(&self, table: &str) -> Option<(Vec<Column>, Vec<Column>)> {
        if table == self.control.table {
            return Some((self.control.key_columns().to_vec(), self.control.value_columns().to_vec()));
        }
        self.entity(table).map(|e| (e.key.to_vec(), e.values.to_vec()))
    }
}

use ColumnType::{BigInt, Boolean, Date, Numeric, Text, Timestamptz};

const PORTFOLIO_VALUES: &[Column] = &[
    col("long_notional", Numeric),
    col("short_notional", Numeric),
    col("notional", Numeric),
    col("long_wgt", Numeric),
    col("short_wgt", Numeric),
    col("long_rtn", Numeric),
    col("long_cum_rtn", Numeric),
    col("short_rtn", Numeric),
    col("short_cum_rtn", Numeric),
    col("rtn", Numeric),
    col("cum_rtn", Numeric),
];

const POSITION_VALUES: &[Column] = &[
    col("side", BigInt),
    col("asset_id_type", Text),
    col("wgt", Numeric),
    col("quantity", Numeric),
    col("notional", Numeric),
];

const STRATEGY_VALUES: &[Column] = &[
    col("decision_ts", Timestamptz),
    col("factor", Numeric),
    col("decision", BigInt),
];

const ORDERS_VALUES: &[Column] = &[
    col("side", BigInt),
    col("asset_id_type", Text),
    col("target_wgt", Numeric),
    col("real_wgt", Numeric),
    col("quantity", Numeric),
    col("notional", Numeric),
];

pub const PORTFOLIO: PipelineSchema = PipelineSchema {
    name: "portfolio",
    entities: &[
        EntitySchema {
            name: "portfolio",
            key: &[col("portfolio_id", BigInt), col("portfolio_ts", Timestamptz)],
            values: PORTFOLIO_VALUES,
        },
        EntitySchema {
            name: "portfolio_latest",
            key: &[col("portfolio_id", BigInt)],
            values: &[
                col("portfolio_ts", Timestamptz),
                col("long_notional", Numeric),
                col("short_notional", Numeric),
                col("notional", Numeric),
                col("long_wgt", Numeric),
                col("short_wgt", Numeric),
                col("long_rtn", Numeric),
                col("long_cum_rtn", Numeric),
                col("short_rtn", Numeric),
                col("short_cum_rtn", Numeric),
                col("rtn", Numeric),
                col("cum_rtn", Numeric),
            ],
        },
        EntitySchema {
            name: "position",
            key: &[
                col("portfolio_id", BigInt),
                col("asset_id", Text),
                col("position_ts", Timestamptz),
            ],
            values: POSITION_VALUES,
        },
        EntitySchema {
            name: "position_latest",
            key: &[col("portfolio_id", BigInt), col("asset_id", Text)],
            values: &[
                col("side", BigInt),
                col("asset_id_type", Text),
                col("position_ts", Timestamptz),
                col("wgt", Numeric),
                col("quantity", Numeric),
                col("notional", Numeric),
            ],
        },
    ],
    control: ControlSchema {
        table: "portfolio_control",
        owner_column: "portfolio_id",
        timestamp_column: "last_monitor_ts",
    },
};

pub const STRATEGY: PipelineSchema = PipelineSchema {
    name: "strategy",
    entities: &[
        EntitySchema {
            name: "strategy",
            key: &[
                col("strategy_id", BigInt),
                col("asset_id_type", Text),
                col("asset_id", Text),
                col("datadate", Date),
            ],
            values: STRATEGY_VALUES,
        },
        EntitySchema {
            name: "strategy_latest",
            key: &[
                col("strategy_id", BigInt),
                col("asset_id_type", Text),
                col("asset_id", Text),
            ],
            values: &[
                col("datadate", Date),
                col("decision_ts", Timestamptz),
                col("factor", Numeric),
                col("decision", BigInt),
            ],
        },
        EntitySchema {
            name: "strategy_config",
            key: &[col("strategy_id", BigInt)],
            values: &[
                col("strategy_name", Text),
                col("strategy_type", Text),
                col("alpha", Text),
                col("factor", Text),
                col("signal_lifetime", Text),
                col("top_threshold", BigInt),
                col("top_threshold_type", Text),
                col("bottom_threshold", BigInt),
                col("bottom_threshold_type", Text),
                col("strategy_hash", Text),
            ],
        },
    ],
    control: ControlSchema {
        table: "strategy_control",
        owner_column: "strategy_id",
        timestamp_column: "last_decision_ts",
    },
};

pub const ORDERS: PipelineSchema = PipelineSchema {
    name: "orders",
    entities: &[
        EntitySchema {
            name: "orders",
            key: &[
                col("portfolio_id", BigInt),
                col("asset_id", Text),
                col("order_ts", Timestamptz),
            ],
            values: ORDERS_VALUES,
        },
        EntitySchema {
            name: "orders_latest",
            key: &[col("portfolio_id", BigInt), col("asset_id", Text)],
            values: &[
                col("side", BigInt),
                col("asset_id_type", Text),
                col("order_ts", Timestamptz),
                col("target_wgt", Numeric),
                col("real_wgt", Numeric),
                col("quantity", Numeric),
                col("notional", Numeric),
            ],
        },
        EntitySchema {
            name: "orders_config",
            key: &[col("portfolio_id", BigInt)],
            values: &[
                col("strategy_id", BigInt),
                col("portfolio_type", Text),
                col("rebal_freq", Text),
                col("adjust", Boolean),
                col("wgt_method", Text),
                col("portfolio_hash", Text),
                col("account_id", Text),
            ],
        },
    ],
    control: ControlSchema {
        table: "orders_control",
        owner_column: "portfolio_id",
        timestamp_column: "last_rebal_ts",
    },
};

pub static PIPELINES: &[PipelineSchema] = &[PORTFOLIO, STRATEGY, ORDERS];

pub fn pipeline(name: &str) -> Option<&'static PipelineSchema> {
    PIPELINES.iter().find(|p| p.name == name)
}
