use std::collections::BTreeMap;
use std::fmt::Write as _;

use super::registry::ChannelId;

/// Name of the reserved event synthesized once the document has been parsed.
pub const DOM_CONTENT_LOADED_EVENT: &str = "CustomDOMContentLoaded";

/// Script path under which hosts expose their message channels.
pub const DEFAULT_HANDLERS_ROOT: &str = "window.webkit.messageHandlers";

/// Produces the script-side stub that forwards one named event to a native
/// channel.
///
/// Parameter expressions are inserted verbatim; they may refer to `params`,
/// which is bound to the dispatched event's `detail` (or `{}` when absent).
pub trait ScriptProvider {
    fn script(
        &self,
        event_name: &str,
        parameters: &BTreeMap<String, String>,
        channel: &ChannelId,
    ) -> String;
}

/// Listens on `window` and posts the evaluated parameters through
/// `<handlers_root>[channel].postMessage(...)`.
#[derive(Debug, Clone)]
pub struct ListenerScriptProvider {
    handlers_root: String,
}

impl ListenerScriptProvider {
    pub fn new(handlers_root: impl Into<String>) -> Self {
        Self {
            handlers_root: handlers_root.into(),
        }
    }
}

impl Default for ListenerScriptProvider {
    fn default() -> Self {
        Self::new(DEFAULT_HANDLERS_ROOT)
    }
}

impl ScriptProvider for ListenerScriptProvider {
    fn script(
        &self,
        event_name: &str,
        parameters: &BTreeMap<String, String>,
        channel: &ChannelId,
    ) -> String {
        let mut body = String::new();
        for (key, expression) in parameters {
            let _ = writeln!(body, "        {}: {},", js_string(key), expression);
        }

        format!(
            r#"window.addEventListener({event}, function (event) {{
    var params = (event && event.detail) || {{}};
    {root}[{channel}].postMessage({{
{body}    }});
}});
"#,
            event = js_string(event_name),
            root = self.handlers_root,
            channel = js_string(channel.as_str()),
            body = body,
        )
    }
}

/// Script that synthesizes [`DOM_CONTENT_LOADED_EVENT`] on `window`.
///
/// Injected at document end after the listener stubs, so the stub for the
/// reserved event is already attached when this runs.
pub fn dom_ready_dispatch_script() -> String {
    format!(
        "window.dispatchEvent(new CustomEvent({}));\n",
        js_string(DOM_CONTENT_LOADED_EVENT)
    )
}

/// JSON string literals are valid script string literals.
pub(crate) fn js_string(value: &str) -> String {
    serde_json::Value::from(value).to_string()
}
