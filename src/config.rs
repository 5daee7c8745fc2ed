//! YAML route files.
//!
//! A route file scripts a [`RouteTable`] without code: global before/after
//! actions, then routes tried in order.
//!
//! ```yaml
//! routes:
//!   - id: list-users
//!     when:
//!       type: exact
//!       value: "GET:http://api.test/users"
//!     actions:
//!       - type: delay
//!         min_ms: 5
//!         max_ms: 20
//!       - type: send
//!         status: 200
//!         body:
//!           type: json
//!           content: [{ id: 1 }]
//! ```

use crate::error::{MockError, RequestError};
use crate::headers::Headers;
use crate::http::{Action, Condition, Forward, Matcher, RouteSettings, RouteTable};
use crate::template::{TemplateContext, TemplateEngine};
use crate::timers;
use anyhow::Context as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::rc::Rc;

/// A whole route file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    #[serde(default)]
    pub settings: GlobalSettings,

    /// Run for every matched request before its route's actions.
    #[serde(default)]
    pub before: Vec<ActionConfig>,

    /// Run for every matched request after its route's actions.
    #[serde(default)]
    pub after: Vec<ActionConfig>,

    /// Tried in declaration order.
    #[serde(default)]
    pub routes: Vec<RouteDefinition>,
}

impl RouteConfig {
    /// Load and validate a route file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read route file {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("in route file {}", path.display()))
    }

    /// Parse and validate route YAML.
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (i, action) in self.before.iter().enumerate() {
            action
                .validate()
                .map_err(|e| anyhow::anyhow!("before action {i}: {e}"))?;
        }
        for (i, action) in self.after.iter().enumerate() {
            action
                .validate()
                .map_err(|e| anyhow::anyhow!("after action {i}: {e}"))?;
        }

        let mut ids = HashSet::new();
        for (i, route) in self.routes.iter().enumerate() {
            route
                .validate()
                .map_err(|e| anyhow::anyhow!("route {i} ({}): {e}", route.id))?;
            if !ids.insert(route.id.as_str()) {
                anyhow::bail!("route {i}: duplicate id {:?}", route.id);
            }
        }
        Ok(())
    }

    /// Routes that take part in matching.
    pub fn enabled_routes(&self) -> impl Iterator<Item = &RouteDefinition> {
        self.routes.iter().filter(|route| route.enabled)
    }
}

/// Logging switches, mapped onto [`RouteSettings`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    #[serde(default)]
    pub log_matches: bool,

    #[serde(default = "default_true")]
    pub log_unmatched: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            log_matches: false,
            log_unmatched: true,
        }
    }
}

impl From<&GlobalSettings> for RouteSettings {
    fn from(settings: &GlobalSettings) -> Self {
        RouteSettings {
            log_matches: settings.log_matches,
            log_unmatched: settings.log_unmatched,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_status() -> u16 {
    200
}

/// One matcher and its actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteDefinition {
    pub id: String,

    pub when: ConditionConfig,

    #[serde(default)]
    pub actions: Vec<ActionConfig>,

    /// Requests this route accepts before it is skipped (0 = unlimited).
    #[serde(default)]
    pub max_matches: u32,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl RouteDefinition {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.id.is_empty() {
            anyhow::bail!("route id cannot be empty");
        }
        self.when.validate()?;
        for (i, action) in self.actions.iter().enumerate() {
            action
                .validate()
                .map_err(|e| anyhow::anyhow!("action {i}: {e}"))?;
        }
        Ok(())
    }
}

/// Route condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionConfig {
    /// `[METHOD:]url` or `[METHOD:]/path`.
    Exact { value: String },
    Regex { pattern: String },
    Glob { pattern: String },
    Any,
}

impl ConditionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.to_condition()?;
        Ok(())
    }

    pub fn to_condition(&self) -> Result<Condition, MockError> {
        match self {
            ConditionConfig::Exact { value } => Ok(Condition::Exact(value.clone())),
            ConditionConfig::Regex { pattern } => Condition::regex(pattern),
            ConditionConfig::Glob { pattern } => Condition::glob(pattern),
            ConditionConfig::Any => Ok(Condition::Any),
        }
    }
}

/// A response body given inline, encoded, or by file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BodyConfig {
    Text { content: String },
    Json { content: serde_json::Value },
    Base64 { content: String },
    File { path: String },
}

impl BodyConfig {
    pub fn to_bytes(&self) -> anyhow::Result<Bytes> {
        match self {
            BodyConfig::Text { content } => Ok(Bytes::from(content.clone())),
            BodyConfig::Json { content } => Ok(serde_json::to_vec(content)?.into()),
            BodyConfig::Base64 { content } => Ok(crate::http::request::decode(content.as_bytes(), "base64")?),
            BodyConfig::File { path } => std::fs::read(path)
                .map(Bytes::from)
                .with_context(|| format!("failed to read body file {path}")),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            BodyConfig::Text { .. } => "text/plain",
            BodyConfig::Json { .. } => "application/json",
            BodyConfig::Base64 { .. } | BodyConfig::File { .. } => "application/octet-stream",
        }
    }
}

/// Fixed or random latency.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DelayConfig {
    #[serde(default)]
    pub fixed_ms: u64,

    #[serde(default)]
    pub min_ms: u64,

    #[serde(default)]
    pub max_ms: u64,
}

impl DelayConfig {
    /// Delay for one request. `fixed_ms` wins; otherwise a uniform pick in
    /// `[min_ms, max_ms]`.
    pub fn sample(&self) -> u64 {
        if self.fixed_ms > 0 {
            self.fixed_ms
        } else if self.max_ms > self.min_ms {
            use rand::Rng;
            rand::thread_rng().gen_range(self.min_ms..=self.max_ms)
        } else {
            self.min_ms
        }
    }

    fn is_random(&self) -> bool {
        self.fixed_ms == 0 && self.max_ms > self.min_ms
    }
}

/// A scripted step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionConfig {
    Delay(DelayConfig),
    Write {
        body: BodyConfig,
    },
    WriteHead {
        #[serde(default)]
        status: Option<u16>,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    End {
        #[serde(default)]
        status: Option<u16>,
        #[serde(default)]
        body: Option<BodyConfig>,
    },
    Send {
        #[serde(default = "default_status")]
        status: u16,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<BodyConfig>,
        /// Render the body per request with Handlebars.
        #[serde(default)]
        template: bool,
    },
    Emit {
        event: String,
        #[serde(default)]
        args: Vec<serde_json::Value>,
    },
    Throw {
        message: String,
    },
    Forward {
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<BodyConfig>,
    },
}

fn check_status(status: u16) -> anyhow::Result<()> {
    if !(100..=599).contains(&status) {
        anyhow::bail!("invalid status code: {status}");
    }
    Ok(())
}

impl ActionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        match self {
            ActionConfig::Delay(delay) => {
                if delay.fixed_ms == 0 && delay.max_ms != 0 && delay.max_ms < delay.min_ms {
                    anyhow::bail!("delay max_ms {} is below min_ms {}", delay.max_ms, delay.min_ms);
                }
            }
            ActionConfig::Write { body } => {
                body.to_bytes()?;
            }
            ActionConfig::WriteHead { status, .. } | ActionConfig::End { status, body: None } => {
                if let Some(status) = status {
                    check_status(*status)?;
                }
            }
            ActionConfig::End {
                status,
                body: Some(body),
            } => {
                if let Some(status) = status {
                    check_status(*status)?;
                }
                body.to_bytes()?;
            }
            ActionConfig::Send {
                status,
                body,
                template,
                ..
            } => {
                check_status(*status)?;
                match body {
                    Some(BodyConfig::Base64 { .. } | BodyConfig::File { .. }) if *template => {
                        anyhow::bail!("only text and json bodies can be templates");
                    }
                    Some(BodyConfig::Text { content }) if *template => {
                        crate::template::check(content).context("invalid body template")?;
                    }
                    Some(BodyConfig::Json { content }) if *template => {
                        crate::template::check_json(content).context("invalid body template")?;
                    }
                    Some(body) if !*template => {
                        body.to_bytes()?;
                    }
                    _ => {}
                }
            }
            ActionConfig::Emit { event, .. } => {
                if event.is_empty() {
                    anyhow::bail!("event name cannot be empty");
                }
            }
            ActionConfig::Throw { .. } => {}
            ActionConfig::Forward { target, body, .. } => {
                if let Some(target) = target {
                    crate::uri::parse_annotated(target)
                        .map_err(|e| anyhow::anyhow!("invalid forward target {target:?}: {e}"))?;
                }
                if let Some(body) = body {
                    body.to_bytes()?;
                }
            }
        }
        Ok(())
    }

    /// Build the live action. Bodies are loaded now, templates are
    /// rendered per request.
    pub fn to_action(&self, engine: &Rc<TemplateEngine>) -> Result<Action, MockError> {
        let load = |body: &BodyConfig| body.to_bytes().map_err(|e| MockError::Config(format!("{e:#}")));

        Ok(match self {
            ActionConfig::Delay(delay) if delay.is_random() => {
                let delay = delay.clone();
                Action::compute(move |_, _, next| {
                    timers::schedule_after(move || next.done(), delay.sample());
                })
            }
            ActionConfig::Delay(delay) => Action::Delay(delay.sample()),
            ActionConfig::Write { body } => Action::Write {
                chunk: load(body)?,
                then: None,
            },
            ActionConfig::WriteHead { status, headers } => Action::WriteHead {
                status: *status,
                headers: Headers::from(headers.clone()),
            },
            ActionConfig::End { status, body } => Action::End {
                status: *status,
                body: body.as_ref().map(load).transpose()?,
            },
            ActionConfig::Send {
                status,
                headers,
                body,
                template,
            } => {
                let mut headers = Headers::from(headers.clone());
                if let Some(body) = body {
                    if !headers.contains("content-type") {
                        headers.set("content-type", body.content_type());
                    }
                }
                match body {
                    Some(body) if *template => templated_send(engine.clone(), *status, headers, body.clone()),
                    _ => Action::Send {
                        status: *status,
                        body: body.as_ref().map(load).transpose()?.unwrap_or_default(),
                        headers,
                    },
                }
            }
            ActionConfig::Emit { event, args } => Action::Emit {
                event: event.clone(),
                args: args.clone(),
            },
            ActionConfig::Throw { message } => Action::Throw(RequestError::scripted(message.clone())),
            ActionConfig::Forward {
                target,
                headers,
                body,
            } => Action::Forward(Forward {
                target: target.clone(),
                body: body.as_ref().map(load).transpose()?,
                headers: Headers::from(headers.clone()),
            }),
        })
    }
}

fn templated_send(engine: Rc<TemplateEngine>, status: u16, headers: Headers, body: BodyConfig) -> Action {
    Action::compute(move |req, res, next| {
        let ctx = TemplateContext::from_request(req);
        let rendered = match &body {
            BodyConfig::Text { content } => engine.render(content, &ctx),
            BodyConfig::Json { content } => engine
                .render_json(content, &ctx)
                .map(|value| value.to_string()),
            BodyConfig::Base64 { .. } | BodyConfig::File { .. } => Ok(String::new()),
        };
        match rendered {
            Ok(text) => {
                res.merge_headers(&headers);
                res.set_status_code(status);
                res.push(Some(Bytes::from(text)));
                res.push(None);
                next.done();
            }
            Err(err) => next.fail(RequestError::Template {
                message: err.to_string(),
            }),
        }
    })
}

fn build_matcher(route: &RouteDefinition, engine: &Rc<TemplateEngine>) -> Result<Matcher, MockError> {
    let mut matcher = Matcher::new(route.when.to_condition()?);
    matcher.id = Some(route.id.clone());
    if route.max_matches > 0 {
        matcher.remaining = Some(route.max_matches);
    }
    matcher.actions = route
        .actions
        .iter()
        .map(|action| action.to_action(engine))
        .collect::<Result<_, _>>()?;
    Ok(matcher)
}

impl RouteTable {
    /// Build a table from a route file. Disabled routes are left out.
    pub fn from_config(config: &RouteConfig) -> Result<Self, MockError> {
        let engine = Rc::new(TemplateEngine::new());
        let table = RouteTable::with_settings((&config.settings).into());

        for action in &config.before {
            table.add_before(action.to_action(&engine)?);
        }
        for action in &config.after {
            table.add_after(action.to_action(&engine)?);
        }
        for route in config.enabled_routes() {
            table.add_matcher(build_matcher(route, &engine)?);
        }
        Ok(table)
    }
}
