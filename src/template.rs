//! Handlebars response templates.
//!
//! Route files may mark a `send` body as a template. It is rendered against
//! the intercepted request every time the route runs:
//!
//! | name | value |
//! | --- | --- |
//! | `method` | upper-case method |
//! | `url` | full request URL |
//! | `path` | pathname, no query |
//! | `query` | decoded query parameters |
//! | `headers` | lower-case header names |
//! | `body` | request body, when it is UTF-8 |
//! | `json` | request body, when it parses as JSON |

use crate::http::ClientRequest;
use chrono::format::{Item, StrftimeItems};
use handlebars::{
    handlebars_helper, Context, Handlebars, Helper, HelperResult, Output, RenderContext, RenderError,
    RenderErrorReason, Template, TemplateError,
};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Values a template can refer to.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TemplateContext {
    pub method: String,
    pub url: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
}

impl TemplateContext {
    /// Snapshot of a request as it stands, usually once its body has ended.
    pub fn from_request(req: &ClientRequest) -> Self {
        let options = req.options();
        let query = options
            .query()
            .map(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();
        let body = String::from_utf8(req.body().to_vec())
            .ok()
            .filter(|body| !body.is_empty());
        let json = body.as_deref().and_then(|body| serde_json::from_str(body).ok());

        Self {
            method: req.method(),
            url: req.url(),
            path: req.pathname(),
            query,
            headers: req.headers().into(),
            body,
            json,
        }
    }
}

/// Handlebars registry with the response helpers installed.
pub struct TemplateEngine {
    registry: Handlebars<'static>,
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        registry.register_helper("json", Box::new(json_helper));
        registry.register_helper("default", Box::new(default_helper));
        registry.register_helper("upper", Box::new(upper_helper));
        registry.register_helper("lower", Box::new(lower_helper));
        registry.register_helper("uuid", Box::new(uuid));
        registry.register_helper("now", Box::new(now));
        registry.register_helper("random", Box::new(random));
        // Bodies are not HTML.
        registry.register_escape_fn(handlebars::no_escape);
        Self { registry }
    }

    pub fn render(&self, template: &str, ctx: &TemplateContext) -> Result<String, RenderError> {
        self.registry.render_template(template, ctx)
    }

    /// Render every string inside `value` that contains a mustache.
    pub fn render_json(&self, value: &Value, ctx: &TemplateContext) -> Result<Value, RenderError> {
        Ok(match value {
            Value::String(text) if text.contains("{{") => Value::String(self.render(text, ctx)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.render_json(item, ctx))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(fields) => {
                let mut rendered = serde_json::Map::with_capacity(fields.len());
                for (key, field) in fields {
                    rendered.insert(key.clone(), self.render_json(field, ctx)?);
                }
                Value::Object(rendered)
            }
            other => other.clone(),
        })
    }
}

/// Parse `source` without rendering it.
pub fn check(source: &str) -> Result<(), TemplateError> {
    Template::compile(source).map(|_| ())
}

/// [`check`] every templated string inside `value`.
pub fn check_json(value: &Value) -> Result<(), TemplateError> {
    match value {
        Value::String(text) if text.contains("{{") => check(text),
        Value::Array(items) => items.iter().try_for_each(check_json),
        Value::Object(fields) => fields.values().try_for_each(check_json),
        _ => Ok(()),
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

handlebars_helper!(json_helper: |value: Json| serde_json::to_string(value).unwrap_or_default());
handlebars_helper!(upper_helper: |value: str| value.to_uppercase());
handlebars_helper!(lower_helper: |value: str| value.to_lowercase());
handlebars_helper!(default_helper: |value: Json, fallback: Json| match value {
    Value::Null => fallback.clone(),
    Value::String(text) if text.is_empty() => fallback.clone(),
    other => other.clone(),
});

/// Random version 4 UUID.
fn uuid(
    _: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let mut bytes: [u8; 16] = rand::thread_rng().gen();
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    out.write(&format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    ))?;
    Ok(())
}

/// Current UTC time, `strftime` format as the optional first parameter.
fn now(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let format = h
        .param(0)
        .and_then(|param| param.value().as_str())
        .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");
    let items: Vec<Item> = StrftimeItems::new(format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(RenderErrorReason::Other(format!("invalid time format {format:?}")).into());
    }

    let mut stamp = String::new();
    write!(stamp, "{}", chrono::Utc::now().format_with_items(items.into_iter()))
        .map_err(|_| RenderErrorReason::Other(format!("cannot format time with {format:?}")))?;
    out.write(&stamp)?;
    Ok(())
}

/// Integer in `[min, max]`, `0` and `100` by default.
fn random(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let bound = |index: usize, fallback: i64| {
        h.param(index)
            .and_then(|param| param.value().as_i64())
            .unwrap_or(fallback)
    };
    let (min, max) = (bound(0, 0), bound(1, 100));
    let value = if max > min {
        rand::thread_rng().gen_range(min..=max)
    } else {
        min
    };
    out.write(&value.to_string())?;
    Ok(())
}
