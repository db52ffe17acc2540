/// A registered enumeration backing `enum=` and `set=` columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enum {
    code: String,
    values: Vec<String>,
    default: String,
}

impl Enum {
    /// The first value is the default.
    #[must_use]
    pub fn new(code: &str, values: &[&str]) -> Self {
        let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        let default = values.first().cloned().unwrap_or_default();
        Self {
            code: code.to_string(),
            values,
            default,
        }
    }

    #[must_use]
    pub fn with_default(mut self, default: &str) -> Self {
        self.default = default.to_string();
        self
    }

    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    #[must_use]
    pub fn values(&self) -> &[String] {
        &self.values
    }

    #[must_use]
    pub fn default_value(&self) -> &str {
        &self.default
    }

    #[must_use]
    pub fn has(&self, value: &str) -> bool {
        self.values.iter().any(|v| v == value)
    }

    #[must_use]
    pub fn index(&self, value: &str) -> Option<usize> {
        self.values.iter().position(|v| v == value)
    }
}
