//! Worker binary hosting the demo types used by the integration tests.
//!
//! Run by a parent with: remotehost-demo-worker <token>

use std::process::ExitCode;
use std::time::Duration;

use chrono::{DateTime, Utc};
use remotehost::{Arguments, Hosted, OperationError, Operations, Registry, Value};

struct DemoClass;

impl DemoClass {
    fn echo_method(
        &self,
        text: String,
        _label: String,
        _at: DateTime<Utc>,
        _count: Option<i64>,
        _until: Option<DateTime<Utc>>,
    ) -> String {
        text
    }
}

impl Hosted for DemoClass {
    fn operations() -> Operations<Self> {
        Operations::new()
            .operation("EchoMethod", 5, |demo: &DemoClass, args: Arguments| {
                let echoed = demo.echo_method(
                    args.get(0)?,
                    args.get(1)?,
                    args.get(2)?,
                    args.get(3)?,
                    args.get(4)?,
                );
                Ok(Value::from(echoed))
            })
            .operation("Echo", 1, |_, args| args.get::<Value>(0))
            .operation("Add", 2, |_, args| {
                let a: i64 = args.get(0)?;
                let b: i64 = args.get(1)?;
                a.checked_add(b)
                    .map(Value::from)
                    .ok_or_else(|| OperationError::failed("integer overflow"))
            })
            .operation("Fail", 1, |_, args| {
                let message: String = args.get(0)?;
                Err(OperationError::Failed(message))
            })
            .operation("Sleep", 1, |_, args| {
                let ms: i64 = args.get(0)?;
                std::thread::sleep(Duration::from_millis(ms.max(0) as u64));
                Ok(Value::Null)
            })
            .operation("Pid", 0, |_, _| Ok(Value::from(std::process::id())))
            .operation("Panic", 0, |_, _| panic!("demo panic"))
    }
}

/// Construction always fails.
struct Broken;

impl Hosted for Broken {
    fn operations() -> Operations<Self> {
        Operations::new()
    }
}

fn main() -> ExitCode {
    let registry = Registry::new()
        .with_hosted("DemoClass", || DemoClass)
        .with_fallible_hosted("Broken", || -> Result<Broken, String> {
            Err("model weights not found".to_string())
        });
    remotehost::run_from_args(registry)
}
