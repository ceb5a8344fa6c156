//! PostgREST query strings.
//!
//! Filters render as `column=op.value`, ordering as `order=column.asc`, and
//! values are form-encoded so ids with reserved characters survive the trip.

use url::form_urlencoded::byte_serialize;

/// A single column filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Eq(String, String),
    Neq(String, String),
    In(String, Vec<String>),
    Gt(String, String),
    Gte(String, String),
    Lt(String, String),
    Lte(String, String),
    IsNull(String, bool),
}

impl Filter {
    fn render(&self) -> (String, String) {
        match self {
            Filter::Eq(column, value) => (column.clone(), format!("eq.{value}")),
            Filter::Neq(column, value) => (column.clone(), format!("neq.{value}")),
            Filter::In(column, values) => (column.clone(), format!("in.({})", values.join(","))),
            Filter::Gt(column, value) => (column.clone(), format!("gt.{value}")),
            Filter::Gte(column, value) => (column.clone(), format!("gte.{value}")),
            Filter::Lt(column, value) => (column.clone(), format!("lt.{value}")),
            Filter::Lte(column, value) => (column.clone(), format!("lte.{value}")),
            Filter::IsNull(column, true) => (column.clone(), "is.null".to_string()),
            Filter::IsNull(column, false) => (column.clone(), "not.is.null".to_string()),
        }
    }
}

/// Sort order on one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

impl Order {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
        }
    }
}

/// Builder for the query part of a table request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    select: Option<String>,
    filters: Vec<Filter>,
    order: Vec<Order>,
    limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, columns: impl Into<String>) -> Self {
        self.select = Some(columns.into());
        self
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl ToString) -> Self {
        self.filters
            .push(Filter::Eq(column.into(), value.to_string()));
        self
    }

    pub fn neq(mut self, column: impl Into<String>, value: impl ToString) -> Self {
        self.filters
            .push(Filter::Neq(column.into(), value.to_string()));
        self
    }

    pub fn in_list<I, V>(mut self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        self.filters.push(Filter::In(
            column.into(),
            values.into_iter().map(|v| v.to_string()).collect(),
        ));
        self
    }

    pub fn gt(mut self, column: impl Into<String>, value: impl ToString) -> Self {
        self.filters
            .push(Filter::Gt(column.into(), value.to_string()));
        self
    }

    pub fn gte(mut self, column: impl Into<String>, value: impl ToString) -> Self {
        self.filters
            .push(Filter::Gte(column.into(), value.to_string()));
        self
    }

    pub fn lt(mut self, column: impl Into<String>, value: impl ToString) -> Self {
        self.filters
            .push(Filter::Lt(column.into(), value.to_string()));
        self
    }

    pub fn lte(mut self, column: impl Into<String>, value: impl ToString) -> Self {
        self.filters
            .push(Filter::Lte(column.into(), value.to_string()));
        self
    }

    pub fn is_null(mut self, column: impl Into<String>, null: bool) -> Self {
        self.filters.push(Filter::IsNull(column.into(), null));
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order.push(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn is_unfiltered(&self) -> bool {
        self.filters.is_empty()
    }

    /// Render as a query string without the leading `?`.
    pub fn to_query_string(&self) -> String {
        let mut pairs: Vec<(String, String)> = Vec::new();
        if let Some(select) = &self.select {
            pairs.push(("select".to_string(), select.clone()));
        }
        pairs.extend(self.filters.iter().map(Filter::render));
        if !self.order.is_empty() {
            let order = self
                .order
                .iter()
                .map(|o| {
                    format!(
                        "{}.{}",
                        o.column,
                        if o.ascending { "asc" } else { "desc" }
                    )
                })
                .collect::<Vec<_>>()
                .join(",");
            pairs.push(("order".to_string(), order));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }

        pairs
            .iter()
            .map(|(key, value)| format!("{}={}", encode(key), encode(value)))
            .collect::<Vec<_>>()
            .join("&")
    }
}

fn encode(raw: &str) -> String {
    byte_serialize(raw.as_bytes()).collect()
}
