//! Build-time compiler configuration, following a small builder-struct
//! pattern rather than free-standing constants.

/// The method name treated as a class's initializer. Defaults to
/// `"constructor"`, matching `original_source`'s `LOXJ_OPTIONS_INIT`.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    initializer_name: String,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            initializer_name: "constructor".to_string(),
        }
    }
}

impl CompilerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// ```rust,ignore
    /// let config = CompilerConfig::new().initializer_name("init");
    /// ```
    pub fn initializer_name(mut self, name: impl Into<String>) -> Self {
        self.initializer_name = name.into();
        self
    }

    pub fn initializer_name_str(&self) -> &str {
        &self.initializer_name
    }
}
