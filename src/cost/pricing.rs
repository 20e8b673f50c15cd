use serde::{Deserialize, Serialize};

/// Integer credit prices for one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingTable {
    /// Charged for every completed exchange.
    #[serde(default = "default_base")]
    pub base: i64,
    /// Flat surcharge when documentation retrieval ran at least once.
    #[serde(default = "default_retrieval")]
    pub retrieval: i64,
    /// Per external search call.
    #[serde(default = "default_external_per_call")]
    pub external_per_call: i64,
    /// Per call of a tool outside the retrieval, search and lookup classes,
    /// beyond the first.
    #[serde(default = "default_extra_tool")]
    pub extra_tool: i64,
}

fn default_base() -> i64 {
    5
}

fn default_retrieval() -> i64 {
    5
}

fn default_external_per_call() -> i64 {
    3
}

fn default_extra_tool() -> i64 {
    1
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            base: default_base(),
            retrieval: default_retrieval(),
            external_per_call: default_external_per_call(),
            extra_tool: default_extra_tool(),
        }
    }
}

/// How a tool call is billed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolClass {
    Retrieval,
    External,
    /// History lookups; never billed.
    Internal,
    Other,
}

/// Successful tool calls made during one exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub retrieval_calls: u32,
    pub external_calls: u32,
    #[serde(default)]
    pub internal_calls: u32,
    pub other_calls: u32,
}

impl TurnRecord {
    pub fn record(&mut self, class: ToolClass) {
        match class {
            ToolClass::Retrieval => self.retrieval_calls += 1,
            ToolClass::External => self.external_calls += 1,
            ToolClass::Internal => self.internal_calls += 1,
            ToolClass::Other => self.other_calls += 1,
        }
    }

    pub fn merge(&mut self, other: &TurnRecord) {
        self.retrieval_calls += other.retrieval_calls;
        self.external_calls += other.external_calls;
        self.internal_calls += other.internal_calls;
        self.other_calls += other.other_calls;
    }

    pub fn total_calls(&self) -> u32 {
        self.retrieval_calls + self.external_calls + self.internal_calls + self.other_calls
    }
}

impl PricingTable {
    /// Price an exchange from its tool usage.
    pub fn price(&self, record: &TurnRecord) -> i64 {
        let retrieval = if record.retrieval_calls > 0 { self.retrieval } else { 0 };
        let external = i64::from(record.external_calls) * self.external_per_call;
        let extra = i64::from(record.other_calls.saturating_sub(1)) * self.extra_tool;
        self.base + retrieval + external + extra
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_answer_costs_base() {
        assert_eq!(PricingTable::default().price(&TurnRecord::default()), 5);
    }

    #[test]
    fn retrieval_plus_two_external() {
        let mut record = TurnRecord::default();
        record.record(ToolClass::Retrieval);
        record.record(ToolClass::External);
        record.record(ToolClass::External);
        assert_eq!(PricingTable::default().price(&record), 16);
    }

    #[test]
    fn retrieval_surcharge_is_flat() {
        let record = TurnRecord {
            retrieval_calls: 3,
            ..TurnRecord::default()
        };
        assert_eq!(PricingTable::default().price(&record), 10);
    }

    #[test]
    fn first_other_call_is_free() {
        let table = PricingTable::default();
        let one = TurnRecord {
            other_calls: 1,
            ..TurnRecord::default()
        };
        let three = TurnRecord {
            other_calls: 3,
            ..TurnRecord::default()
        };
        assert_eq!(table.price(&one), 5);
        assert_eq!(table.price(&three), 7);
        assert_eq!(three.total_calls(), 3);
    }

    #[test]
    fn history_lookups_are_never_billed() {
        let mut record = TurnRecord::default();
        for _ in 0..14 {
            record.record(ToolClass::Internal);
        }
        record.record(ToolClass::External);
        assert_eq!(record.internal_calls, 14);
        assert_eq!(record.total_calls(), 15);
        assert_eq!(PricingTable::default().price(&record), 8);
    }

    #[test]
    fn table_deserializes_with_defaults() {
        let table: PricingTable = serde_json::from_str(r#"{"base": 2}"#).unwrap();
        assert_eq!(table.base, 2);
        assert_eq!(table.external_per_call, 3);
    }
}
