//! The embedded JavaScript engine.
//!
//! Each invocation gets its own QuickJS runtime and context, so script code
//! never observes concurrent mutation and no state leaks between requests.
//! Scripts must define `Run(context)`; the legacy implicit-`this` style is
//! not supported. All data crosses the boundary as JSON.

use rquickjs::{Context, Ctx, Function, Runtime};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{InternalDispatch, ScriptError};
use crate::events::context::{ScriptInput, ScriptOutput};

/// Memory ceiling for one interpreter.
const MEMORY_LIMIT: usize = 32 * 1024 * 1024;
const STACK_LIMIT: usize = 1024 * 1024;

/// Builds the `context` object and records side effects. Everything the
/// host reads back lives in `out`.
const PRELUDE: &str = r#"
function __mkContext(input) {
  const out = {
    errors: {}, hidden: [], protected: [], cancelled: null,
    emitted: [], logs: [], result: null, responseData: null,
    statusCode: null, headers: {}
  };
  function __call(method, path, query, body) {
    const res = JSON.parse(__haven_internal_raw(
      method, path,
      JSON.stringify(query === undefined ? null : query),
      JSON.stringify(body === undefined ? null : body)
    ));
    if (res.error) throw new Error(res.error);
    return res.value;
  }
  const ctx = {
    data: input.data,
    query: input.query,
    me: input.me,
    isRoot: input.isRoot,
    method: input.method,
    url: input.url,
    parts: input.parts,
    error(field, message) { out.errors[String(field)] = String(message); },
    hide(field) { out.hidden.push(String(field)); },
    protect(field) { out.protected.push(String(field)); },
    cancel(message, status) {
      out.cancelled = { message: String(message), status: typeof status === 'number' ? status : 400 };
      throw { __havenCancel: true };
    },
    emit(event, data, room) {
      out.emitted.push({
        event: String(event),
        data: data === undefined ? null : data,
        room: room === undefined ? null : room
      });
    },
    log(msg, kv) { out.logs.push({ msg: String(msg), kv: kv === undefined ? null : kv }); },
    setResult(v) { out.result = v === undefined ? null : v; },
    setResponseData(v) { out.responseData = v === undefined ? null : v; },
    setStatusCode(n) { out.statusCode = n; },
    setHeader(k, v) { out.headers[String(k)] = String(v); },
    getHeader(k) { return input.headers[String(k).toLowerCase()]; },
    internal: {
      get(collection, query) { return __call('GET', collection, query, null); },
      post(collection, body) { return __call('POST', collection, null, body); },
      put(collection, id, body) { return __call('PUT', collection + '/' + id, null, body); },
      delete(collection, id) { return __call('DELETE', collection + '/' + id, null, null); }
    }
  };
  return { ctx: ctx, out: out };
}
"#;

/// Runs `Run(context)` and serializes the outcome. User exceptions are
/// captured here, so an eval error from this block means the interpreter
/// itself gave up (interrupt or OOM).
const DRIVER: &str = r#"
(function () {
  const input = JSON.parse(__INPUT);
  const made = __mkContext(input);
  let threw = null;
  try {
    if (typeof Run !== 'function') {
      throw new Error("script must define Run(context)");
    }
    Run(made.ctx);
  } catch (e) {
    if (!(e && e.__havenCancel)) {
      threw = e instanceof Error ? e.message : String(e);
    }
  }
  return JSON.stringify({ data: made.ctx.data, out: made.out, threw: threw });
})()
"#;

/// Compile and run a script source against an input snapshot.
///
/// Blocking; callers dispatch through `spawn_blocking`.
pub fn run(
    source: &str,
    input: &ScriptInput,
    internal: InternalDispatch,
    timeout: Duration,
) -> Result<ScriptOutput, ScriptError> {
    let runtime =
        Runtime::new().map_err(|e| ScriptError::Failed(format!("runtime: {e}")))?;
    runtime.set_memory_limit(MEMORY_LIMIT);
    runtime.set_max_stack_size(STACK_LIMIT);

    let deadline = Instant::now() + timeout;
    runtime.set_interrupt_handler(Some(Box::new(move || Instant::now() >= deadline)));

    let context = Context::full(&runtime)
        .map_err(|e| ScriptError::Failed(format!("context: {e}")))?;

    let input_json = serde_json::to_string(input)
        .map_err(|e| ScriptError::Failed(format!("input encoding: {e}")))?;

    let raw: Result<String, ScriptError> = context.with(|ctx| {
        ctx.globals()
            .set("__INPUT", input_json)
            .map_err(|e| failure(&ctx, e, deadline))?;
        register_internal(&ctx, internal).map_err(|e| failure(&ctx, e, deadline))?;

        ctx.eval::<(), _>(PRELUDE)
            .map_err(|e| failure(&ctx, e, deadline))?;
        ctx.eval::<(), _>(source)
            .map_err(|e| failure(&ctx, e, deadline))?;
        ctx.eval::<String, _>(DRIVER)
            .map_err(|e| failure(&ctx, e, deadline))
    });

    let raw = raw?;
    serde_json::from_str(&raw)
        .map_err(|e| ScriptError::Failed(format!("output decoding: {e}")))
}

/// Expose the in-process client to scripts. The raw hook exchanges JSON
/// strings; the prelude wraps it in `context.internal`.
fn register_internal(ctx: &Ctx<'_>, internal: InternalDispatch) -> rquickjs::Result<()> {
    let dispatch = Arc::clone(&internal);
    let hook = Function::new(
        ctx.clone(),
        move |method: String, path: String, query: String, body: String| -> String {
            let query = serde_json::from_str(&query).unwrap_or(serde_json::Value::Null);
            let body = serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
            match dispatch(&method, &path, query, body) {
                Ok(value) => serde_json::json!({ "value": value }).to_string(),
                Err(message) => serde_json::json!({ "error": message }).to_string(),
            }
        },
    )?;
    ctx.globals().set("__haven_internal_raw", hook)
}

/// Map an eval failure, distinguishing deadline interrupts from real errors.
fn failure(ctx: &Ctx<'_>, error: rquickjs::Error, deadline: Instant) -> ScriptError {
    if Instant::now() >= deadline {
        return ScriptError::Timeout;
    }
    match error {
        rquickjs::Error::Exception => {
            let caught = ctx.catch();
            let message = caught
                .as_exception()
                .and_then(|exc| exc.message())
                .unwrap_or_else(|| format!("{caught:?}"));
            ScriptError::Failed(message)
        }
        other => ScriptError::Failed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn input(data: serde_json::Value) -> ScriptInput {
        ScriptInput {
            data,
            query: json!({}),
            me: None,
            is_root: false,
            method: "POST".into(),
            url: "/todos".into(),
            parts: vec!["todos".into()],
            headers: BTreeMap::from([("x-request-id".to_string(), "r1".to_string())]),
            timeout_ms: 2_000,
        }
    }

    fn no_internal() -> InternalDispatch {
        Arc::new(|_: &str, _: &str, _: serde_json::Value, _: serde_json::Value| {
            Err("internal client unavailable".to_string())
        })
    }

    fn run_source(source: &str, data: serde_json::Value) -> ScriptOutput {
        run(source, &input(data), no_internal(), Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn data_mutations_propagate() {
        let output = run_source(
            "function Run(ctx) { ctx.data.title = ctx.data.title.toUpperCase(); }",
            json!({"title": "abc"}),
        );
        assert_eq!(output.data, json!({"title": "ABC"}));
        assert!(output.threw.is_none());
    }

    #[test]
    fn error_accumulates_field_errors() {
        let output = run_source(
            r#"function Run(ctx) {
                 if (ctx.data.title.length < 3) ctx.error('title', 'too short');
               }"#,
            json!({"title": "ab"}),
        );
        assert_eq!(output.out.errors["title"], "too short");
    }

    #[test]
    fn cancel_aborts_with_status() {
        let output = run_source(
            "function Run(ctx) { ctx.cancel('not allowed', 403); ctx.error('x', 'unreached'); }",
            json!({}),
        );
        let cancelled = output.out.cancelled.unwrap();
        assert_eq!(cancelled.message, "not allowed");
        assert_eq!(cancelled.status, 403);
        assert!(output.out.errors.is_empty());
        assert!(output.threw.is_none());
    }

    #[test]
    fn uncaught_exceptions_are_reported() {
        let output = run_source("function Run(ctx) { throw new Error('boom'); }", json!({}));
        assert_eq!(output.threw.as_deref(), Some("boom"));
    }

    #[test]
    fn missing_run_is_an_error() {
        let output = run_source("const x = 1;", json!({}));
        assert!(output.threw.unwrap().contains("must define Run"));
    }

    #[test]
    fn emit_hide_and_headers() {
        let output = run_source(
            r#"function Run(ctx) {
                 ctx.emit('custom', {n: 1}, 'lobby');
                 ctx.hide('secret');
                 ctx.setHeader('X-From-Script', 'yes');
                 ctx.setStatusCode(202);
                 ctx.log('hello', {k: 1});
               }"#,
            json!({}),
        );
        assert_eq!(output.out.emitted.len(), 1);
        assert_eq!(output.out.emitted[0].room.as_deref(), Some("lobby"));
        assert_eq!(output.out.hidden, vec!["secret"]);
        assert_eq!(output.out.headers["X-From-Script"], "yes");
        assert_eq!(output.out.status_code, Some(202));
        assert_eq!(output.out.logs[0].msg, "hello");
    }

    #[test]
    fn get_header_is_case_insensitive() {
        let output = run_source(
            "function Run(ctx) { ctx.data.rid = ctx.getHeader('X-Request-Id'); }",
            json!({}),
        );
        assert_eq!(output.data["rid"], json!("r1"));
    }

    #[test]
    fn infinite_loops_hit_the_deadline() {
        let err = run(
            "function Run(ctx) { while (true) {} }",
            &input(json!({})),
            no_internal(),
            Duration::from_millis(200),
        )
        .unwrap_err();
        assert!(matches!(err, ScriptError::Timeout));
    }

    #[test]
    fn internal_errors_surface_as_exceptions() {
        let output = run_source(
            r#"function Run(ctx) {
                 try { ctx.internal.get('todos', {}); }
                 catch (e) { ctx.data.caught = e.message; }
               }"#,
            json!({}),
        );
        assert_eq!(output.data["caught"], json!("internal client unavailable"));
    }

    #[test]
    fn internal_dispatch_round_trips() {
        let internal: InternalDispatch =
            Arc::new(|method: &str, path: &str, _query: serde_json::Value, body: serde_json::Value| {
                Ok(json!({"method": method, "path": path, "echo": body}))
            });
        let output = run(
            "function Run(ctx) { ctx.data.res = ctx.internal.post('todos', {title: 'x'}); }",
            &input(json!({})),
            internal,
            Duration::from_secs(2),
        )
        .unwrap();
        assert_eq!(output.data["res"]["method"], json!("POST"));
        assert_eq!(output.data["res"]["path"], json!("todos"));
        assert_eq!(output.data["res"]["echo"]["title"], json!("x"));
    }

    #[test]
    fn syntax_errors_fail_compilation() {
        let err = run(
            "function Run(ctx { }",
            &input(json!({})),
            no_internal(),
            Duration::from_secs(2),
        )
        .unwrap_err();
        assert!(matches!(err, ScriptError::Failed(_)));
    }
}
