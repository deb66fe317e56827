//! Built-in workload served by the stock bootstrap.

use std::thread;
use std::time::Duration;

use isohost::{HostContext, HostedObject, WorkloadRegistry};
use serde_json::{json, Value};

pub(crate) const DEMO_MODULE: &str = "isohost.demo";

struct Counter {
    value: i64,
}

impl HostedObject for Counter {
    fn invoke(&mut self, ctx: &mut HostContext<'_>, method: &str, args: Value) -> Result<Value, String> {
        match method {
            "add" => {
                self.value += args.as_i64().unwrap_or(1);
                ctx.emit("counter.changed", json!({ "value": self.value }));
                Ok(json!(self.value))
            }
            "get" => Ok(json!(self.value)),
            other => Err(format!("Counter has no method {other:?}")),
        }
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, String> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing string argument {key:?}"))
}

pub(crate) fn demo_registry() -> WorkloadRegistry {
    let mut reg = WorkloadRegistry::new();
    reg.register_callback("echo", |_, args| Ok(args))
        .register_callback("sleep", |_, args| {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
            thread::sleep(Duration::from_millis(ms));
            Ok(json!(ms))
        })
        .register_callback("fail", |_, args| {
            Err(args
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("requested failure")
                .to_string())
        })
        .register_callback("panic", |_, _| panic!("requested panic"))
        .register_callback("emit", |ctx, args| {
            let count = args.get("count").and_then(Value::as_u64).unwrap_or(1);
            for index in 0..count {
                ctx.emit("test.result", json!({ "index": index, "outcome": "passed" }));
            }
            Ok(json!(count))
        })
        .register_callback("env", |_, args| {
            let name = str_arg(&args, "name")?;
            Ok(json!(std::env::var(name).ok()))
        })
        .register_callback("cwd", |_, _| {
            let dir = std::env::current_dir().map_err(|e| e.to_string())?;
            serde_json::to_value(dir).map_err(|e| e.to_string())
        })
        .register_callback("property", |ctx, args| {
            let key = str_arg(&args, "key")?;
            Ok(json!(ctx.property(key)))
        })
        .register_callback("section", |ctx, args| {
            let path = str_arg(&args, "path")?;
            Ok(ctx.section(path).cloned().unwrap_or(Value::Null))
        })
        .register_callback("runtime", |ctx, _| {
            Ok(match ctx.runtime() {
                Some(rt) => json!({ "label": rt.setup().label, "options": rt.setup().options }),
                None => Value::Null,
            })
        })
        .register_callback("resolve", |ctx, args| {
            let name = str_arg(&args, "name")?;
            let found = ctx.resolve_dependency(name)?;
            serde_json::to_value(found).map_err(|e| e.to_string())
        })
        .register_type(DEMO_MODULE, "Counter", |_| Ok(Box::new(Counter { value: 0 })));
    reg
}
