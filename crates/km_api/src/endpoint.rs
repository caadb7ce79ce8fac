/// A fixed backend target: base URL plus the `User-Agent` the wrapper
/// advertises. All request paths are joined against this.
#[derive(Clone, Debug)]
pub struct BackendEndpoint {
    base_url: String,
    user_agent: String,
}

impl BackendEndpoint {
    pub fn new(base_url: impl Into<String>, user_agent: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            user_agent: user_agent.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Joins a path (or passes through an already-absolute URL).
    pub fn join(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let path = path.strip_prefix('/').unwrap_or(path);
        format!("{}/{}", self.base_url, path)
    }
}
