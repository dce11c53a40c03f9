//! Date Math Tool
//!
//! Adds or subtracts intervals from a base date.

use async_trait::async_trait;
use chrono::{Days, Months, NaiveDate};

use agent_core::{
    AgentError, ParamType, ParameterSchema, Result, Tool, ToolArgs, ToolDescriptor, ToolOutput,
};

const DELTA_TYPES: [&str; 4] = ["day", "week", "month", "year"];

const DESCRIPTION: &str = "Adds or subtracts one or more time intervals from a given date in the format YYYY-MM-DD.

The <deltas></deltas> to be added or subtracted should be separated by commas. Use negative values to subtract, as shown in the <example_deltas></example_deltas>:

<example_deltas>
<example_delta>5</example_delta>
<example_delta>-7, -14, -21</example_delta>
<example_delta>5, -6, -8</example_delta>
</example_deltas>";

/// Interval unit applied to every delta
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DeltaType {
    Day,
    Week,
    Month,
    Year,
}

impl DeltaType {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "day" => Some(Self::Day),
            "week" => Some(Self::Week),
            "month" => Some(Self::Month),
            "year" => Some(Self::Year),
            _ => None,
        }
    }

    /// Shift `base` by `amount` units; month and year shifts clamp to the
    /// last valid day of the target month
    fn apply(self, base: NaiveDate, amount: i64) -> Option<NaiveDate> {
        let magnitude = amount.unsigned_abs();
        match self {
            Self::Day | Self::Week => {
                let days = if self == Self::Week { magnitude.checked_mul(7)? } else { magnitude };
                if amount < 0 {
                    base.checked_sub_days(Days::new(days))
                } else {
                    base.checked_add_days(Days::new(days))
                }
            }
            Self::Month | Self::Year => {
                let months = if self == Self::Year { magnitude.checked_mul(12)? } else { magnitude };
                let months = Months::new(u32::try_from(months).ok()?);
                if amount < 0 {
                    base.checked_sub_months(months)
                } else {
                    base.checked_add_months(months)
                }
            }
        }
    }
}

/// Compute one or more dates relative to a base date.
///
/// Output is `YYYY-MM-DD Weekday` per delta, joined by commas.
pub fn date_math(base_date: &str, deltas: &str, delta_type: &str) -> Result<String> {
    let unit = DeltaType::parse(delta_type).ok_or_else(|| {
        AgentError::ToolValidation(format!("delta_type must be one of {DELTA_TYPES:?}"))
    })?;

    let base = NaiveDate::parse_from_str(base_date.trim(), "%Y-%m-%d").map_err(|_| {
        AgentError::ToolValidation("please provide a base_date in the format YYYY-MM-DD".into())
    })?;

    let amounts = deltas
        .split(',')
        .map(|d| {
            d.trim().parse::<i64>().map_err(|_| {
                AgentError::ToolValidation(format!("'{}' is not an integer delta", d.trim()))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let dates = amounts
        .into_iter()
        .map(|amount| {
            unit.apply(base, amount)
                .map(|date| date.format("%Y-%m-%d %A").to_string())
                .ok_or_else(|| {
                    AgentError::ToolExecution(format!("{amount} {delta_type}(s) from {base} is out of range"))
                })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(dates.join(","))
}

/// `do_date_math` tool
pub struct DateMathTool {
    descriptor: ToolDescriptor,
}

impl DateMathTool {
    pub fn new() -> Self {
        let descriptor = ToolDescriptor::new("do_date_math", DESCRIPTION)
            .param(ParameterSchema::required(
                "base_date",
                ParamType::String,
                "Base date in the format YYYY-MM-DD",
            ))
            .param(ParameterSchema::required(
                "deltas",
                ParamType::String,
                "Intervals, as defined in delta_type, to add or subtract from the base date, separated by commas",
            ))
            .param(
                ParameterSchema::required(
                    "delta_type",
                    ParamType::String,
                    "Type of interval to sum or subtract from base_date",
                )
                .with_enum(DELTA_TYPES),
            );
        Self { descriptor }
    }
}

impl Default for DateMathTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for DateMathTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, args: ToolArgs) -> Result<ToolOutput> {
        let base_date = args.str("base_date").unwrap_or_default();
        let deltas = args.str("deltas").unwrap_or_default();
        let delta_type = args.str("delta_type").unwrap_or_default();
        date_math(base_date, deltas, delta_type).map(ToolOutput::Text)
    }
}
