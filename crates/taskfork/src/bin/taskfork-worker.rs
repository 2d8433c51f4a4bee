//! Worker binary bundling the `echo` task.
//!
//! `taskfork-worker echo [--delay-ms N] [--fail-on BYTE] [--exit-when-idle-after-ms N]`
//!
//! `echo` returns its input unchanged. `--delay-ms` sleeps before answering,
//! `--fail-on` fails any input containing that byte, and
//! `--exit-when-idle-after-ms` asks the controller for permission to exit
//! whenever nothing has been in flight for that long.

use std::thread;
use std::time::Duration;

use anyhow::{Context, bail};
use taskfork::bytes::Bytes;
use taskfork::worker::entry;
use taskfork::{Lifecycle, Task, TaskRegistry};

#[derive(Debug, Default)]
struct Echo {
    delay: Option<Duration>,
    fail_on: Option<u8>,
    idle_exit_after: Option<Duration>,
}

impl Echo {
    fn from_args(args: &[String]) -> anyhow::Result<Self> {
        let mut echo = Self::default();
        let mut args = args.iter();
        while let Some(flag) = args.next() {
            let mut value = || {
                args.next()
                    .with_context(|| format!("{flag} requires a value"))
            };
            match flag.as_str() {
                "--delay-ms" => echo.delay = Some(Duration::from_millis(value()?.parse()?)),
                "--fail-on" => echo.fail_on = Some(value()?.parse()?),
                "--exit-when-idle-after-ms" => {
                    echo.idle_exit_after = Some(Duration::from_millis(value()?.parse()?));
                }
                other => bail!("unknown echo option {other}"),
            }
        }
        Ok(echo)
    }
}

impl Task for Echo {
    fn run(&self, input: Bytes) -> anyhow::Result<Vec<u8>> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if let Some(byte) = self.fail_on
            && input.contains(&byte)
        {
            bail!("input contains rejected byte {byte}");
        }
        Ok(input.to_vec())
    }

    fn attach(&self, lifecycle: Lifecycle) {
        let Some(idle) = self.idle_exit_after else {
            return;
        };
        let spawned = thread::Builder::new()
            .name("echo-idle-watch".to_string())
            .spawn(move || {
                while !lifecycle.is_draining() {
                    thread::sleep(idle);
                    if lifecycle.in_flight() == 0 && lifecycle.request_exit() {
                        tracing::info!("Exit granted while idle");
                        break;
                    }
                }
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "Failed to start idle watcher");
        }
    }
}

fn main() {
    let registry = TaskRegistry::new().register("echo", Echo::from_args);
    std::process::exit(entry::main_with(registry));
}
