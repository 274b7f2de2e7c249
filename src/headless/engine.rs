use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use anyhow::{Context as AnyhowContext, Result};
use rquickjs::{Context, Ctx, Error as JsError, Function, Runtime, Value};

/// A message a script posted to `webkit.messageHandlers[channel]`, with the
/// body already serialized to JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedMessage {
    pub channel: String,
    pub body: String,
}

pub type Outbox = Rc<RefCell<VecDeque<PostedMessage>>>;

const MAX_PENDING_JOBS: usize = 1000;

/// QuickJS-backed script context for one loaded document.
///
/// Installs a minimal browser-like global (`window`, `document`, `Event`,
/// `CustomEvent`, listener registration) and a WebKit-style
/// `webkit.messageHandlers` object whose `postMessage` calls land in the
/// [`Outbox`]. Messages are queued rather than delivered, so native handlers
/// never run while the engine is mid-evaluation.
pub struct ScriptEngine {
    runtime: Runtime,
    context: Context,
}

impl ScriptEngine {
    pub fn new(outbox: Outbox) -> Result<Self> {
        let runtime = Runtime::new().context("failed to create QuickJS runtime")?;
        let context = Context::full(&runtime).context("failed to create QuickJS context")?;
        let engine = Self { runtime, context };
        engine.init_globals(outbox)?;
        Ok(engine)
    }

    /// Evaluate a script and discard the result.
    pub fn eval(&self, source: &str, filename: &str) -> Result<()> {
        self.eval_with::<()>(source, filename)
    }

    /// Evaluate a script and convert the result into `V`.
    pub fn eval_with<V>(&self, source: &str, filename: &str) -> Result<V>
    where
        V: for<'js> rquickjs::FromJs<'js>,
    {
        let script = with_source_url(source, filename);
        let value = self.context.with(|ctx| {
            ctx.eval::<V, _>(script).map_err(|err| match err {
                JsError::Exception => anyhow::anyhow!(
                    "{filename}: {}",
                    describe_exception(&ctx).unwrap_or_else(|| "uncaught exception".into())
                ),
                other => anyhow::Error::from(other),
            })
        })?;

        self.execute_pending_jobs();
        Ok(value)
    }

    /// Drains the promise job queue, giving up after `MAX_PENDING_JOBS`.
    fn execute_pending_jobs(&self) {
        let mut executed = 0usize;
        while self.runtime.is_job_pending() {
            if executed == MAX_PENDING_JOBS {
                tracing::warn!(target: "quickjs", limit = MAX_PENDING_JOBS, "pending job limit reached");
                break;
            }
            match self.runtime.execute_pending_job() {
                Ok(true) => executed += 1,
                Ok(false) => break,
                Err(err) => {
                    tracing::error!(target: "quickjs", error = ?err, "pending job failed");
                    break;
                }
            }
        }
        if executed > 0 {
            tracing::debug!(target: "quickjs", executed, "ran pending jobs");
        }
    }

    fn init_globals(&self, outbox: Outbox) -> Result<()> {
        self.context
            .with(|ctx| {
                let global = ctx.globals();

                let log_fn = Function::new(ctx.clone(), log_from_js)?.with_name("__webbridge_log")?;
                global.set("__webbridge_log", log_fn)?;

                let post_fn = Function::new(
                    ctx.clone(),
                    move |channel: String, body: String| -> rquickjs::Result<()> {
                        outbox
                            .borrow_mut()
                            .push_back(PostedMessage { channel, body });
                        Ok(())
                    },
                )?
                .with_name("__webbridge_post")?;
                global.set("__webbridge_post", post_fn)?;

                ctx.eval::<(), _>(CONSOLE_BOOTSTRAP.as_bytes())?;
                ctx.eval::<(), _>(WINDOW_BOOTSTRAP.as_bytes())
            })
            .map_err(anyhow::Error::from)
    }
}

fn log_from_js(level: String, message: String) -> rquickjs::Result<()> {
    match level.as_str() {
        "error" => tracing::error!(target: "quickjs", message = %message),
        "warn" => tracing::warn!(target: "quickjs", message = %message),
        "debug" => tracing::debug!(target: "quickjs", message = %message),
        _ => tracing::info!(target: "quickjs", message = %message),
    }
    Ok(())
}

/// Appends a `sourceURL` pragma so stack traces name the injected script.
fn with_source_url(source: &str, filename: &str) -> String {
    let separator = if source.ends_with('\n') { "" } else { "\n" };
    format!("{source}{separator}//# sourceURL={filename}\n")
}

fn describe_exception(ctx: &Ctx<'_>) -> Option<String> {
    let exception: Value = ctx.catch();
    let Some(object) = exception.as_object() else {
        return exception
            .as_string()
            .and_then(|text| text.to_string().ok())
            .or_else(|| Some(format!("{exception:?}")));
    };
    let message: String = object.get("message").ok()?;
    match object.get::<_, String>("stack") {
        Ok(stack) if !stack.is_empty() => Some(format!("{message}\n{stack}")),
        _ => Some(message),
    }
}

const CONSOLE_BOOTSTRAP: &str = r#"
(() => {
    const global = globalThis;
    const stringify = (value) => {
        try {
            if (typeof value === 'string') {
                return value;
            }
            if (value === undefined) {
                return 'undefined';
            }
            if (value === null) {
                return 'null';
            }
            return String(value);
        } catch (err) {
            return '[unprintable]';
        }
    };

    const logger = (level) => (...args) => {
        try {
            global.__webbridge_log(level, args.map(stringify).join(' '));
        } catch (err) {
            // console must never throw
        }
    };

    global.console = {
        log: logger('info'),
        info: logger('info'),
        debug: logger('debug'),
        warn: logger('warn'),
        error: logger('error'),
    };
})();
"#;

const WINDOW_BOOTSTRAP: &str = r#"
(() => {
    const global = globalThis;
    global.window = global;
    global.self = global;

    const makeTarget = (target) => {
        const listeners = Object.create(null);
        target.addEventListener = (type, listener) => {
            if (typeof listener !== 'function') {
                return;
            }
            (listeners[type] = listeners[type] || []).push(listener);
        };
        target.removeEventListener = (type, listener) => {
            const registered = listeners[type];
            if (!registered) {
                return;
            }
            const index = registered.indexOf(listener);
            if (index >= 0) {
                registered.splice(index, 1);
            }
        };
        target.dispatchEvent = (event) => {
            const registered = (listeners[event.type] || []).slice();
            for (const listener of registered) {
                try {
                    listener.call(target, event);
                } catch (err) {
                    console.error(String((err && err.stack) || err));
                }
            }
            return !event.defaultPrevented;
        };
        return target;
    };

    function Event(type, options) {
        this.type = String(type);
        this.bubbles = !!(options && options.bubbles);
        this.cancelable = !!(options && options.cancelable);
        this.defaultPrevented = false;
    }
    Event.prototype.preventDefault = function () {
        if (this.cancelable) {
            this.defaultPrevented = true;
        }
    };

    function CustomEvent(type, options) {
        Event.call(this, type, options);
        this.detail = options && options.detail !== undefined ? options.detail : null;
    }
    CustomEvent.prototype = Object.create(Event.prototype);
    CustomEvent.prototype.constructor = CustomEvent;

    global.Event = Event;
    global.CustomEvent = CustomEvent;

    makeTarget(global);
    global.document = makeTarget({ readyState: 'loading', title: '' });

    const post = global.__webbridge_post;
    global.webkit = {
        messageHandlers: new Proxy({}, {
            get(_target, name) {
                return {
                    postMessage(body) {
                        post(String(name), JSON.stringify(body === undefined ? null : body));
                    },
                };
            },
        }),
    };
})();
"#;
