//! Task Executor: drives a per-guest list of tagged tasks over the
//! SSH Pool and Command Runner. Tasks within one guest run sequentially in
//! declared order; across guests, execution fans out up to a configured
//! concurrency limit. No task is currently marked critical, so a task
//! failure is recorded but never fails range creation.

pub mod validate;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;

use crate::logging::ScriptLogger;
use crate::model::{Task, TaskResult};
use crate::ssh::{Dial, RetryPolicy, RunOptions, SessionKey, SshPool};

/// Everything the executor needs to reach one guest: pool handle, dial
/// parameters, and OS metadata the black-box emulation scripts expect.
#[derive(Clone)]
pub struct GuestContext {
    pub pool: Arc<SshPool>,
    pub dial: Dial,
    pub guest_id: String,
    pub basevm_type: String,
    pub os_type: String,
    /// `<range_dir>/logs`, where each task's stdout/stderr is archived.
    pub logs_dir: PathBuf,
}

fn new_task_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("task-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

async fn run_argv(
    ctx: &GuestContext,
    argv: Vec<String>,
) -> Result<crate::ssh::CommandOutput, crate::error::RangeError> {
    let session = ctx.pool.get(&ctx.dial).await?;
    let options = RunOptions {
        user: ctx.dial.key.user.clone(),
        expected_codes: vec![0],
        ignore_errors: false,
        retry: Some(RetryPolicy::default()),
        retry_on_nonzero_exit: false,
    };
    crate::ssh::runner::run(session, &ctx.dial.key.host, &argv, &options).await
}

fn failed_result(task_id: String, kind: &str, guest: &str, message: String, started: Instant) -> TaskResult {
    TaskResult {
        task_id,
        kind: kind.into(),
        guest: guest.into(),
        success: false,
        message,
        output: String::new(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

/// Runs one task and always returns a result — errors are captured into
/// the result rather than propagated, per the non-fatal TaskError policy.
pub async fn execute_task(ctx: &GuestContext, task: &Task) -> TaskResult {
    let task_id = new_task_id();
    let kind = task.kind();
    let started = Instant::now();

    let argv_result: Result<Vec<String>, crate::error::RangeError> = match task {
        Task::AddAccount(a) | Task::ModifyAccount(a) => validate::validate_username(&a.account)
            .map(|_| {
                vec![
                    "bash".into(),
                    "/tmp/cyris-account-helper.sh".into(),
                    a.account.clone(),
                    a.passwd.clone().unwrap_or_default(),
                ]
            }),
        Task::InstallPackage(p) => validate::validate_package_manager(&p.package_manager).map(|_| {
            let mut argv = vec![p.package_manager.clone(), "install".into(), "-y".into()];
            argv.push(match &p.version {
                Some(v) => format!("{}={}", p.name, v),
                None => p.name.clone(),
            });
            argv
        }),
        Task::CopyContent(c) => validate::validate_path_arg(&c.src)
            .and_then(|_| validate::validate_path_arg(&c.dst))
            .map(|_| {
                vec![
                    "bash".into(),
                    "/tmp/cyris-copy-helper.sh".into(),
                    c.src.clone(),
                    c.dst.clone(),
                    ctx.dial.key.host.clone(),
                    ctx.basevm_type.clone(),
                    ctx.os_type.clone(),
                ]
            }),
        Task::ExecuteProgram(e) => validate::validate_interpreter(&e.interpreter).map(|_| {
            let mut argv = vec![e.interpreter.clone(), e.program.clone()];
            argv.extend(e.args.iter().cloned());
            argv
        }),
        Task::EmulateAttack(a) => Ok(vec![
            "bash".into(),
            "/opt/cyris/scripts/emulate_attack.sh".into(),
            a.attack_type.clone(),
            a.target_account.clone(),
            a.attempts.to_string(),
        ]),
        Task::EmulateMalware(m) => Ok(vec![
            "bash".into(),
            "/opt/cyris/scripts/emulate_malware.sh".into(),
            m.malware_name.clone(),
            m.mode.clone(),
        ]),
        Task::EmulateTrafficCapture(t) => Ok(vec![
            "bash".into(),
            "/opt/cyris/scripts/traffic_capture.sh".into(),
            t.interface.clone(),
            t.duration_s.to_string(),
        ]),
        Task::FirewallRules(f) => Ok(std::iter::once("bash".to_string())
            .chain(std::iter::once(
                "/opt/cyris/scripts/firewall_rules.sh".to_string(),
            ))
            .chain(
                f.rules
                    .iter()
                    .flat_map(|r| vec![r.src_network.clone(), r.dst_network.clone(), r.action.clone()]),
            )
            .collect()),
    };

    let argv = match argv_result {
        Ok(argv) => argv,
        Err(e) => return failed_result(task_id, kind, &ctx.guest_id, e.to_string(), started),
    };

    match run_argv(ctx, argv).await {
        Ok(output) => {
            log_task_output(&ctx.logs_dir, &ctx.guest_id, kind, &task_id, &output);
            TaskResult {
                task_id,
                kind: kind.into(),
                guest: ctx.guest_id.clone(),
                success: output.success,
                message: if output.success {
                    "ok".into()
                } else {
                    format!("exit {}: {}", output.exit_code, output.stderr.trim())
                },
                output: output.stdout,
                elapsed_ms: output.elapsed.as_millis() as u64,
            }
        }
        Err(e) => failed_result(task_id, kind, &ctx.guest_id, e.to_string(), started),
    }
}

/// Archives one task's stdout/stderr under `logs_dir`, named
/// `<guest>-<kind>-<task_id>`. Best-effort: a logging failure never fails
/// the task itself.
fn log_task_output(
    logs_dir: &std::path::Path,
    guest_id: &str,
    kind: &str,
    task_id: &str,
    output: &crate::ssh::CommandOutput,
) {
    let script_name = format!("{guest_id}-{kind}-{task_id}");
    let Ok(mut logger) = ScriptLogger::new(logs_dir, &script_name) else {
        return;
    };
    logger.write_line(&output.stdout);
    if !output.stderr.is_empty() {
        logger.write_line(&output.stderr);
    }
    logger.finish(output.success);
}

/// Runs every task for one guest sequentially, in declared order.
pub async fn execute_guest(ctx: &GuestContext, tasks: &[Task]) -> Vec<TaskResult> {
    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        results.push(execute_task(ctx, task).await);
    }
    results
}

/// Runs every guest's task list concurrently, up to `fanout` guests at
/// once — embarrassingly parallel across guests, sequential within one.
pub async fn execute_all(
    guests: Vec<(GuestContext, Vec<Task>)>,
    fanout: usize,
) -> Vec<TaskResult> {
    let semaphore = Arc::new(Semaphore::new(fanout.max(1)));
    let mut handles = Vec::with_capacity(guests.len());

    for (ctx, tasks) in guests {
        let semaphore = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            execute_guest(&ctx, &tasks).await
        }));
    }

    let mut all_results = Vec::new();
    for handle in handles {
        if let Ok(results) = handle.await {
            all_results.extend(results);
        }
    }
    all_results
}

pub fn session_key(host: &str, port: u16, user: &str) -> SessionKey {
    SessionKey {
        host: host.to_string(),
        port,
        user: user.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InstallPackageTask;

    #[test]
    fn install_package_argv_includes_version() {
        let task = Task::InstallPackage(InstallPackageTask {
            name: "nmap".into(),
            version: Some("7.92".into()),
            package_manager: "apt-get".into(),
        });
        assert_eq!(task.kind(), "install_package");
    }
}
