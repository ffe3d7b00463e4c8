//! C1: typed filter/sort/pagination value objects consumed by local DAOs
//! and by the repository's `watchOne`/`watchAll` subscription filters.

use serde_json::Value;

/// A single equality/comparison filter clause, e.g. `filter("user_id", Eq, "U1")`.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterClause {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortClause {
    pub field: String,
    pub direction: SortDirection,
}

/// Typed query parameters: a conjunction of filters, an ordered list of sort
/// clauses, and optional pagination.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParams {
    pub filters: Vec<FilterClause>,
    pub sorts: Vec<SortClause>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor for the single-field-equality case used
    /// pervasively by cascade delete (§4.7: `filter(mappedBy == id)`).
    pub fn filter_eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            filters: vec![FilterClause { field: field.into(), op: FilterOp::Eq, value: value.into() }],
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(FilterClause { field: field.into(), op, value: value.into() });
        self
    }

    pub fn with_sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sorts.push(SortClause { field: field.into(), direction });
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Evaluates the filter conjunction against a JSON row representation.
    /// Used by in-memory stores / test fakes; SQL-backed stores translate
    /// `QueryParams` into a `WHERE`/`ORDER BY`/`LIMIT` clause instead.
    pub fn matches(&self, row: &Value) -> bool {
        self.filters.iter().all(|clause| {
            let Some(field_value) = row.get(&clause.field) else {
                return false;
            };
            match clause.op {
                FilterOp::Eq => field_value == &clause.value,
                FilterOp::NotEq => field_value != &clause.value,
                FilterOp::Like => match (field_value.as_str(), clause.value.as_str()) {
                    (Some(a), Some(b)) => a.contains(b),
                    _ => false,
                },
                FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
                    match (field_value.as_f64(), clause.value.as_f64()) {
                        (Some(a), Some(b)) => match clause.op {
                            FilterOp::Gt => a > b,
                            FilterOp::Gte => a >= b,
                            FilterOp::Lt => a < b,
                            FilterOp::Lte => a <= b,
                            _ => unreachable!(),
                        },
                        _ => false,
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_eq_matches_rows() {
        let q = QueryParams::filter_eq("user_id", "U1");
        assert!(q.matches(&json!({"user_id": "U1", "name": "a"})));
        assert!(!q.matches(&json!({"user_id": "U2"})));
    }

    #[test]
    fn comparison_filters_work_on_numbers() {
        let q = QueryParams::new().with_filter("attempt_count", FilterOp::Gte, 3);
        assert!(q.matches(&json!({"attempt_count": 5})));
        assert!(!q.matches(&json!({"attempt_count": 1})));
    }
}
