//! Detection primitives and their lowering to the fragment dialect.
//!
//! Each primitive compiles to a declarative macro invocation carrying its
//! structural parameters. Keeping the compiled shape declarative rather
//! than hand-built SQL decouples this compiler from the execution engine's
//! exact syntax and lets the engine evolve independently.

use crate::{
    dsl::{self, FilterNode},
    error::{Result, ServiceError},
    outcome::{self, OutcomeKind},
    schema::SchemaEntry,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggFunc {
    fn name(self) -> &'static str {
        match self {
            AggFunc::Count => "count",
            AggFunc::Sum => "sum",
            AggFunc::Avg => "avg",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Eq => "=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceStage {
    pub conditions: Vec<FilterNode>,
    #[serde(default = "default_repeat_min")]
    pub repeat_min: u32,
}

const fn default_repeat_min() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionBlock {
    /// A plain filter, no temporal shape.
    FieldCondition { condition: FilterNode },
    /// Ordered multi-stage pattern over one grouped entity.
    Sequence {
        stages: Vec<SequenceStage>,
        window_sec: u64,
        by: Vec<String>,
        #[serde(default)]
        strict_once: bool,
    },
    /// Windowed aggregate compared against a threshold.
    Rolling {
        #[serde(default)]
        metric: Option<String>,
        func: AggFunc,
        op: CompareOp,
        value: f64,
        window_sec: u64,
        by: Vec<String>,
        #[serde(default)]
        source: Option<FilterNode>,
    },
    /// Ratio of two sub-counts within a bucket.
    Ratio {
        numerator: FilterNode,
        denominator: FilterNode,
        op: CompareOp,
        k: f64,
        bucket_sec: u64,
        by: Vec<String>,
    },
    /// Current window against a historical baseline via standard score.
    Spike {
        metric: String,
        z_threshold: f64,
        window_sec: u64,
        history_buckets: u32,
        by: Vec<String>,
    },
    /// Dimension values not observed in the lookback horizon.
    FirstSeen {
        dimension: String,
        horizon_days: u32,
        by: Vec<String>,
    },
    /// Canonical success/failure predicate, expanded per schema shape.
    Outcome { expect: OutcomeKind },
}

/// Compiles one detection block against a schema snapshot.
pub fn compile_block(block: &DetectionBlock, entry: &SchemaEntry) -> Result<String> {
    match block {
        DetectionBlock::FieldCondition { condition } => dsl::compile_filter(condition, entry),
        DetectionBlock::Sequence {
            stages,
            window_sec,
            by,
            strict_once,
        } => compile_sequence(stages, *window_sec, by, *strict_once, entry),
        DetectionBlock::Rolling {
            metric,
            func,
            op,
            value,
            window_sec,
            by,
            source,
        } => compile_rolling(metric.as_deref(), *func, *op, *value, *window_sec, by, source, entry),
        DetectionBlock::Ratio {
            numerator,
            denominator,
            op,
            k,
            bucket_sec,
            by,
        } => {
            let num = dsl::compile_filter(numerator, entry)?;
            let den = dsl::compile_filter(denominator, entry)?;
            Ok(format!(
                "RATIO(num=({num}), den=({den}), {} {}, bucket={}, by=({}))",
                op.symbol(),
                render_number(*k),
                render_window(*bucket_sec),
                render_by(by, entry)?
            ))
        }
        DetectionBlock::Spike {
            metric,
            z_threshold,
            window_sec,
            history_buckets,
            by,
        } => {
            let metric = dsl::qualify_field(metric, entry)?;
            Ok(format!(
                "SPIKE({metric}, z>={}, window={}, history={history_buckets}, by=({}))",
                render_number(*z_threshold),
                render_window(*window_sec),
                render_by(by, entry)?
            ))
        }
        DetectionBlock::FirstSeen {
            dimension,
            horizon_days,
            by,
        } => {
            let dimension = dsl::qualify_field(dimension, entry)?;
            Ok(format!(
                "FIRST_SEEN({dimension}, horizon={horizon_days}d, by=({}))",
                render_by(by, entry)?
            ))
        }
        DetectionBlock::Outcome { expect } => outcome::expand_outcome(*expect, entry),
    }
}

/// Joins multiple blocks with implicit conjunction.
pub fn compile_blocks(blocks: &[DetectionBlock], entry: &SchemaEntry) -> Result<String> {
    if blocks.is_empty() {
        return Err(ServiceError::MalformedCondition(
            "a rule needs at least one detection block".into(),
        ));
    }
    let parts = blocks
        .iter()
        .map(|block| compile_block(block, entry))
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join("\nAND "))
}

fn compile_sequence(
    stages: &[SequenceStage],
    window_sec: u64,
    by: &[String],
    strict_once: bool,
    entry: &SchemaEntry,
) -> Result<String> {
    if stages.is_empty() {
        return Err(ServiceError::MalformedCondition(
            "sequence needs at least one stage".into(),
        ));
    }

    // A single unrepeated stage degenerates to a plain filter.
    if stages.len() == 1 && stages[0].repeat_min <= 1 {
        return compile_stage_conditions(&stages[0].conditions, entry);
    }

    let mut params = vec![
        format!("window={}", render_window(window_sec)),
        format!("by=({})", render_by(by, entry)?),
    ];
    if strict_once {
        params.push("exclusive".to_string());
    }
    for stage in stages {
        let fragment = compile_stage_conditions(&stage.conditions, entry)?;
        if stage.repeat_min > 1 {
            params.push(format!("STAGE({fragment}, repeat>={})", stage.repeat_min));
        } else {
            params.push(format!("STAGE({fragment})"));
        }
    }

    Ok(format!("SEQUENCE({})", params.join(", ")))
}

fn compile_stage_conditions(conditions: &[FilterNode], entry: &SchemaEntry) -> Result<String> {
    match conditions {
        [] => Ok(dsl::UNIVERSAL_MATCH.to_string()),
        [single] => dsl::compile_filter(single, entry),
        many => {
            let parts = many
                .iter()
                .map(|node| dsl::compile_filter(node, entry))
                .collect::<Result<Vec<_>>>()?;
            Ok(format!("({})", parts.join(" AND ")))
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn compile_rolling(
    metric: Option<&str>,
    func: AggFunc,
    op: CompareOp,
    value: f64,
    window_sec: u64,
    by: &[String],
    source: &Option<FilterNode>,
    entry: &SchemaEntry,
) -> Result<String> {
    let agg = match (func, metric) {
        (AggFunc::Count, _) => "count()".to_string(),
        (func, Some(metric)) => format!("{}({})", func.name(), dsl::qualify_field(metric, entry)?),
        (func, None) => {
            return Err(ServiceError::MalformedCondition(format!(
                "rolling {} requires a metric field",
                func.name()
            )))
        }
    };

    let mut params = vec![
        format!("{agg} {} {}", op.symbol(), render_number(value)),
        format!("window={}", render_window(window_sec)),
        format!("by=({})", render_by(by, entry)?),
    ];
    if let Some(filter) = source {
        params.push(format!("where=({})", dsl::compile_filter(filter, entry)?));
    }

    Ok(format!("ROLLING({})", params.join(", ")))
}

/// Windows are normalized to whole minutes, rounding up.
fn render_window(seconds: u64) -> String {
    let minutes = seconds.div_ceil(60).max(1);
    format!("{minutes}m")
}

fn render_by(by: &[String], entry: &SchemaEntry) -> Result<String> {
    let resolved = by
        .iter()
        .map(|field| dsl::qualify_field(field, entry))
        .collect::<Result<Vec<_>>>()?;
    Ok(resolved.join(", "))
}

fn render_number(value: f64) -> String {
    if value.fract() == 0.0 && value.is_finite() {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}
