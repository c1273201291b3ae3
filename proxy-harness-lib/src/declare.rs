//! Builders for the environment variables a backend declares itself with
//!
//! The proxy discovers routes from these values when a container starts:
//! `VIRTUAL_HOST[<N>]`, `PROXY_FULL_REDIRECT[<N>]` and `PROXY_BASIC_AUTH`.

use std::fmt;

pub const VIRTUAL_HOST_VAR: &str = "VIRTUAL_HOST";
pub const FULL_REDIRECT_VAR: &str = "PROXY_FULL_REDIRECT";
pub const BASIC_AUTH_VAR: &str = "PROXY_BASIC_AUTH";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
    Ws,
    Wss,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        })
    }
}

/// `[scheme://]host[:port][/path][ -> target][; directive]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualHost {
    scheme: Option<Scheme>,
    host: String,
    port: Option<u16>,
    path: Option<String>,
    target: Option<String>,
    directives: Vec<String>,
}

impl VirtualHost {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            scheme: None,
            host: host.into(),
            port: None,
            path: None,
            target: None,
            directives: Vec::new(),
        }
    }

    pub fn scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = Some(scheme);
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Public path prefix; a missing leading `/` is added
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(leading_slash(path.into()));
        self
    }

    /// Upstream side of the route, e.g. `:8080` or `:8080/app`
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl fmt::Display for VirtualHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(scheme) = self.scheme {
            write!(f, "{scheme}://")?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        if let Some(path) = &self.path {
            f.write_str(path)?;
        }
        if let Some(target) = &self.target {
            write!(f, " -> {target}")?;
        }
        for directive in &self.directives {
            write!(f, "; {directive}")?;
        }
        Ok(())
    }
}

/// `source1[,source2,...]->target`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullRedirect {
    sources: Vec<String>,
    target: String,
}

impl FullRedirect {
    pub fn new<I, S>(sources: I, target: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { sources: sources.into_iter().map(Into::into).collect(), target: target.into() }
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl fmt::Display for FullRedirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.sources.join(","), self.target)
    }
}

/// `host[/path] -> user:pass`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    host: String,
    path: Option<String>,
    user: String,
    password: String,
}

impl BasicAuth {
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self { host: host.into(), path: None, user: user.into(), password: password.into() }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(leading_slash(path.into()));
        self
    }

    pub fn credentials(&self) -> (&str, &str) {
        (&self.user, &self.password)
    }
}

impl fmt::Display for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host)?;
        if let Some(path) = &self.path {
            f.write_str(path)?;
        }
        write!(f, " -> {}:{}", self.user, self.password)
    }
}

fn leading_slash(path: String) -> String {
    if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    }
}

/// Numbered variable name: the first declaration is bare, later ones get 1, 2, ...
fn numbered(base: &str, index: usize) -> String {
    match index {
        0 => base.to_string(),
        n => format!("{base}{n}"),
    }
}

/// Environment of a backend container, rendered as `KEY=VALUE` entries
#[derive(Debug, Clone, Default)]
pub struct BackendEnv {
    virtual_hosts: Vec<VirtualHost>,
    redirects: Vec<FullRedirect>,
    basic_auth: Vec<BasicAuth>,
    extra: Vec<(String, String)>,
}

impl BackendEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn virtual_host(mut self, vhost: VirtualHost) -> Self {
        self.virtual_hosts.push(vhost);
        self
    }

    pub fn full_redirect(mut self, redirect: FullRedirect) -> Self {
        self.redirects.push(redirect);
        self
    }

    /// Several rules share the single variable, comma separated
    pub fn basic_auth(mut self, rule: BasicAuth) -> Self {
        self.basic_auth.push(rule);
        self
    }

    pub fn var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    pub fn into_vars(self) -> Vec<String> {
        let mut vars = Vec::new();
        for (i, vhost) in self.virtual_hosts.iter().enumerate() {
            vars.push(format!("{}={vhost}", numbered(VIRTUAL_HOST_VAR, i)));
        }
        for (i, redirect) in self.redirects.iter().enumerate() {
            vars.push(format!("{}={redirect}", numbered(FULL_REDIRECT_VAR, i)));
        }
        if !self.basic_auth.is_empty() {
            let rules: Vec<String> = self.basic_auth.iter().map(ToString::to_string).collect();
            vars.push(format!("{BASIC_AUTH_VAR}={}", rules.join(",")));
        }
        for (key, value) in self.extra {
            vars.push(format!("{key}={value}"));
        }
        vars
    }
}

impl From<BackendEnv> for Vec<String> {
    fn from(env: BackendEnv) -> Self {
        env.into_vars()
    }
}
