//! Generated entrypoint script and parsing of its output
//!
//! The entrypoint runs the compile command once, then every test case assigned
//! to the instance in order. Each case is framed by marker lines written to both
//! stdout and stderr, so the driver can cut the instance's streams back into
//! per-case output whether the instance handled one case or all of them.
//!
//! Layout inside the working directory:
//!
//! ```text
//! .vrun/entrypoint.sh
//! .vrun/tests/<case index>.txt
//! ```

use crate::task::Config;

pub const RUNNER_DIR: &str = ".vrun";
pub const ENTRYPOINT_PATH: &str = ".vrun/entrypoint.sh";

/// Exit status of the `timeout` utility when it had to stop the command.
pub const TIMEOUT_EXIT_STATUS: i64 = 124;

const MARKER_PREFIX: &str = "@@vrun:";

/// Paths under the runner directory cannot be supplied by a task.
pub fn is_reserved_path(path: &str) -> bool {
    path == RUNNER_DIR
        || path
            .strip_prefix(RUNNER_DIR)
            .map_or(false, |rest| rest.starts_with('/'))
}

pub fn input_path(case_index: usize) -> String {
    format!("{}/tests/{}.txt", RUNNER_DIR, case_index)
}

/// Marker lines for one instance, keyed by a nonce the program never sees.
struct Markers {
    prefix: String,
}

impl Markers {
    fn new(nonce: &str) -> Self {
        Self {
            prefix: format!("{}{}:", MARKER_PREFIX, nonce),
        }
    }

    fn begin(&self, case_index: usize) -> String {
        format!("{}begin {}@@\n", self.prefix, case_index)
    }

    fn any_begin(&self) -> String {
        format!("{}begin ", self.prefix)
    }

    fn end(&self, case_index: usize) -> String {
        format!("\n{}end {} ", self.prefix, case_index)
    }

    fn compile_failed(&self) -> String {
        format!("{}compile-failed@@", self.prefix)
    }
}

/// Single-quote `value` for POSIX sh.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Duration argument for `timeout`, in seconds with millisecond precision.
pub fn timeout_arg(limit_ms: u64) -> String {
    let (secs, millis) = (limit_ms / 1000, limit_ms % 1000);
    if millis == 0 {
        secs.to_string()
    } else {
        format!("{}.{:03}", secs, millis)
            .trim_end_matches('0')
            .to_string()
    }
}

/// Render the entrypoint for the given cases.
///
/// The script deletes itself before anything else runs, so `nonce` cannot be
/// read back from the working directory by the program under test.
pub fn render(config: &Config, case_indices: &[usize], working_dir: &str, nonce: &str) -> String {
    let markers = Markers::new(nonce);
    let mut script = String::new();
    script.push_str("#!/bin/sh\n");
    script.push_str("rm -f \"$0\"\n");
    script.push_str(&format!("VRUN_MARK={}\n", shell_quote(&markers.prefix)));
    script.push_str(&format!("cd {} || exit 1\n", shell_quote(working_dir)));

    if let Some(compile) = config.compile_step() {
        script.push_str(&format!(
            "if ! sh -c {} </dev/null 1>&2; then\n",
            shell_quote(compile)
        ));
        script.push_str("  printf '\\n%s\\n' \"${VRUN_MARK}compile-failed@@\"\n");
        script.push_str("  printf '\\n%s\\n' \"${VRUN_MARK}compile-failed@@\" >&2\n");
        script.push_str("  exit 1\nfi\n");
    }

    script.push_str(&format!(
        "if timeout 1 true >/dev/null 2>&1; then VRUN_LIMIT=\"timeout {}\"; else VRUN_LIMIT=\"\"; fi\n",
        timeout_arg(config.time_limit_ms)
    ));
    script.push_str("run_case() {\n");
    script.push_str("  printf '%s\\n' \"${VRUN_MARK}begin $1@@\"\n");
    script.push_str("  printf '%s\\n' \"${VRUN_MARK}begin $1@@\" >&2\n");
    script.push_str(&format!(
        "  $VRUN_LIMIT sh -c {} < \"{}/tests/$1.txt\"\n",
        shell_quote(config.run_command.trim()),
        RUNNER_DIR
    ));
    script.push_str("  status=$?\n");
    script.push_str("  printf '\\n%s\\n' \"${VRUN_MARK}end $1 $status@@\"\n");
    script.push_str("  printf '\\n%s\\n' \"${VRUN_MARK}end $1 $status@@\" >&2\n");
    script.push_str("}\n");

    for index in case_indices {
        script.push_str(&format!("run_case {}\n", index));
    }
    script
}

/// Output of one case cut out of the instance streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaseCapture {
    /// The begin marker was seen.
    pub started: bool,
    pub stdout: String,
    pub stderr: String,
    /// Exit status from the end marker; `None` if the case never finished.
    pub status: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedOutput {
    pub compile_failed: bool,
    /// Everything on stderr before the first case, i.e. compiler output.
    pub compile_stderr: String,
    /// Captures in the order of the requested case indices.
    pub cases: Vec<CaseCapture>,
}

/// Split instance output rendered with `nonce` back into per-case captures.
///
/// Cases are read in the order they ran and each search starts after the
/// previous case's end marker, so output of one case cannot frame another.
pub fn parse_output(stdout: &str, stderr: &str, case_indices: &[usize], nonce: &str) -> ParsedOutput {
    let markers = Markers::new(nonce);
    let first_begin = stdout.find(&markers.any_begin()).unwrap_or(stdout.len());
    let compile_marker = markers.compile_failed();
    let compile_failed = stdout[..first_begin]
        .lines()
        .any(|line| line == compile_marker);
    let compile_stderr = stderr
        .find(&markers.prefix)
        .map_or(stderr, |pos| &stderr[..pos])
        .trim_end_matches('\n')
        .to_string();

    let mut stdout_cursor = 0;
    let mut stderr_cursor = 0;
    let cases = case_indices
        .iter()
        .map(|&index| {
            let (started, out, status) = extract_case(stdout, &mut stdout_cursor, index, &markers);
            let (_, err, _) = extract_case(stderr, &mut stderr_cursor, index, &markers);
            CaseCapture {
                started,
                stdout: out,
                stderr: err,
                status,
            }
        })
        .collect();

    ParsedOutput {
        compile_failed,
        compile_stderr,
        cases,
    }
}

fn extract_case(
    stream: &str,
    cursor: &mut usize,
    case_index: usize,
    markers: &Markers,
) -> (bool, String, Option<i64>) {
    let rest = &stream[*cursor..];
    let begin = markers.begin(case_index);
    let Some(begin_pos) = rest.find(&begin) else {
        return (false, String::new(), None);
    };
    let body_start = *cursor + begin_pos + begin.len();
    let body = &stream[body_start..];

    let end = markers.end(case_index);
    if let Some(end_pos) = body.find(&end) {
        let tail = &body[end_pos + end.len()..];
        let code = tail.split("@@").next().unwrap_or_default();
        let status = code.trim().parse::<i64>().ok();
        *cursor = body_start + end_pos + end.len() + code.len();
        return (true, body[..end_pos].to_string(), status);
    }

    // Unfinished case: keep whatever it printed before the next case began.
    let partial_len = body.find(&markers.any_begin()).unwrap_or(body.len());
    *cursor = body_start + partial_len;
    (true, body[..partial_len].to_string(), None)
}
