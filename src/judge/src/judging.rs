use crate::{
    config::LangConfig,
    limiter::{Limiter, LimiterResult},
    problem::CaseSpec,
};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, warn};
use wire::{CaseResult, ExeStatus};

pub enum CompileOutcome {
    Success,
    Fail(String),
}

/// Scratch area for one submission: the source file, the built binary and
/// per-case output files.
pub struct Workspace {
    dir: tempfile::TempDir,
    source_path: PathBuf,
    bin_path: PathBuf,
}

impl Workspace {
    pub fn prepare(lang: &LangConfig, source: &str) -> std::io::Result<Workspace> {
        let dir = tempfile::tempdir()?;
        let source_path = dir.path().join(&lang.source_name);
        std::fs::write(&source_path, source)?;
        let bin_path = dir.path().join("program");
        Ok(Workspace {
            dir,
            source_path,
            bin_path,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    fn base_dict(&self) -> HashMap<String, String> {
        let mut dict = HashMap::new();
        dict.insert(
            "source".to_string(),
            self.source_path.display().to_string(),
        );
        dict.insert("bin".to_string(), self.bin_path.display().to_string());
        dict.insert("dir".to_string(), self.dir.path().display().to_string());
        dict
    }
}

/// Compiles the submission under the limiter. A failure to compile is a
/// normal outcome carrying the build log; only environment trouble is an
/// error.
pub fn compile(
    lang: &LangConfig,
    limiter: &Limiter,
    workspace: &Workspace,
) -> anyhow::Result<CompileOutcome> {
    if lang.compile.is_empty() {
        return Ok(CompileOutcome::Success);
    }
    let mut dict = workspace.base_dict();
    dict.insert("time-ms".to_string(), lang.compile_time_ms.to_string());
    dict.insert("mem-kb".to_string(), "1048576".to_string());
    let log_path = workspace.path().join("compile.log");
    let record = limiter.run(
        &lang.compile,
        &dict,
        None,
        Some(&log_path),
        Duration::from_millis(lang.compile_time_ms),
    )?;
    if record.status == 0 {
        return Ok(CompileOutcome::Success);
    }
    let mut log = std::fs::read_to_string(&log_path).unwrap_or_default();
    if !record.info.is_empty() {
        if !log.is_empty() {
            log.push('\n');
        }
        log.push_str(&record.info);
    }
    debug!(status = record.status, "compilation rejected by sandbox");
    Ok(CompileOutcome::Fail(log))
}

/// Runs one case and produces its result. Never fails: any environment
/// problem degrades to a `SystemError` result so the judging exchange can
/// continue in a well-defined way.
pub fn run_case(
    lang: &LangConfig,
    limiter: &Limiter,
    workspace: &Workspace,
    data_dir: &Path,
    case: &CaseSpec,
    input_name: &str,
    output_name: &str,
) -> CaseResult {
    match try_run_case(
        lang, limiter, workspace, data_dir, case, input_name, output_name,
    ) {
        Ok(result) => result,
        Err(err) => {
            warn!(error = %format!("{:#}", err), "case execution failed");
            system_error(format!("{:#}", err))
        }
    }
}

fn system_error(info: String) -> CaseResult {
    CaseResult {
        status: ExeStatus::SystemError,
        score: 0,
        time_us: 0,
        memory_kb: 0,
        extra_info: info,
    }
}

fn try_run_case(
    lang: &LangConfig,
    limiter: &Limiter,
    workspace: &Workspace,
    data_dir: &Path,
    case: &CaseSpec,
    input_name: &str,
    output_name: &str,
) -> anyhow::Result<CaseResult> {
    let case_input = data_dir.join(&case.input);
    let mut dict = workspace.base_dict();
    dict.insert("time-ms".to_string(), case.time_ms.to_string());
    dict.insert("mem-kb".to_string(), case.memory_kb.to_string());

    // an empty redirection name means the process standard streams; a
    // non-empty one names a file the program opens in its working directory
    let stdin = if input_name.is_empty() {
        Some(case_input.clone())
    } else {
        std::fs::copy(&case_input, workspace.path().join(input_name))?;
        None
    };
    let stdout_capture = workspace.path().join("stdout.out");
    let (stdout, produced) = if output_name.is_empty() {
        (Some(stdout_capture.clone()), stdout_capture)
    } else {
        (None, workspace.path().join(output_name))
    };

    let record: LimiterResult = limiter.run(
        &lang.execute,
        &dict,
        stdin.as_deref(),
        stdout.as_deref(),
        Duration::from_millis(case.time_ms),
    )?;

    if record.status != 0 {
        let status = ExeStatus::from_code(record.status).unwrap_or(ExeStatus::SystemError);
        return Ok(CaseResult {
            status,
            score: 0,
            time_us: record.time_us,
            memory_kb: record.memory_kb,
            extra_info: record.info,
        });
    }

    let actual = match std::fs::read(&produced) {
        Ok(data) => data,
        Err(_) => {
            return Ok(CaseResult {
                status: ExeStatus::WrongAnswer,
                score: 0,
                time_us: record.time_us,
                memory_kb: record.memory_kb,
                extra_info: "program produced no output".to_string(),
            });
        }
    };
    let expected = std::fs::read(data_dir.join(&case.answer))?;
    let (status, score) = if outputs_match(&actual, &expected) {
        (ExeStatus::Correct, case.score)
    } else {
        (ExeStatus::WrongAnswer, 0)
    };
    Ok(CaseResult {
        status,
        score,
        time_us: record.time_us,
        memory_kb: record.memory_kb,
        extra_info: record.info,
    })
}

/// Line-based comparison ignoring trailing whitespace on each line and
/// trailing blank lines, the classic judge-output rule.
pub fn outputs_match(actual: &[u8], expected: &[u8]) -> bool {
    fn lines(data: &[u8]) -> Vec<&[u8]> {
        let mut lines: Vec<&[u8]> = data
            .split(|&b| b == b'\n')
            .map(|line| {
                let mut end = line.len();
                while end > 0 && (line[end - 1] == b' ' || line[end - 1] == b'\t' || line[end - 1] == b'\r')
                {
                    end -= 1;
                }
                &line[..end]
            })
            .collect();
        while lines.last().map(|l| l.is_empty()).unwrap_or(false) {
            lines.pop();
        }
        lines
    }
    lines(actual) == lines(expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LimiterChannel, LimiterConfig};

    #[test]
    fn whitespace_insensitive_comparison() {
        assert!(outputs_match(b"1 2 3\n", b"1 2 3"));
        assert!(outputs_match(b"1 2 3  \n\n", b"1 2 3\n"));
        assert!(outputs_match(b"a\r\nb\r\n", b"a\nb\n"));
        assert!(!outputs_match(b"1 2 3\n", b"1 2  3\n"));
        assert!(!outputs_match(b"1\n2\n", b"1\n"));
        assert!(!outputs_match(b"", b"x\n"));
        assert!(outputs_match(b"", b"\n"));
    }

    fn fake_limiter(record_script: &str) -> LimiterConfig {
        LimiterConfig {
            command: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                record_script.to_string(),
            ],
            channel: LimiterChannel::File,
        }
    }

    fn ok_record_script() -> &'static str {
        // status 0, 2000 us, 512 kb, no info; then emit the answer
        concat!(
            "printf '\\000\\000\\000\\000",
            "\\320\\007\\000\\000",
            "\\000\\002\\000\\000",
            "\\000\\000\\000\\000' > {result-file}; echo correct"
        )
    }

    fn lang() -> LangConfig {
        LangConfig {
            source_name: "main.sh".to_string(),
            compile: vec![],
            execute: vec!["ignored".to_string()],
            compile_time_ms: 1000,
        }
    }

    fn case_spec() -> CaseSpec {
        CaseSpec {
            input: "1.in".to_string(),
            answer: "1.ans".to_string(),
            time_ms: 1000,
            memory_kb: 1024,
            score: 25,
        }
    }

    #[test]
    fn accepted_case_scores() {
        let data = tempfile::tempdir().unwrap();
        std::fs::write(data.path().join("1.in"), "").unwrap();
        std::fs::write(data.path().join("1.ans"), "correct\n").unwrap();
        let config = fake_limiter(ok_record_script());
        let limiter = Limiter::new(&config);
        let lang = lang();
        let ws = Workspace::prepare(&lang, "echo correct").unwrap();

        let result = run_case(&lang, &limiter, &ws, data.path(), &case_spec(), "", "");
        assert_eq!(result.status, ExeStatus::Correct);
        assert_eq!(result.score, 25);
        assert_eq!(result.time_us, 2000);
        assert_eq!(result.memory_kb, 512);
    }

    #[test]
    fn wrong_output_scores_zero() {
        let data = tempfile::tempdir().unwrap();
        std::fs::write(data.path().join("1.in"), "").unwrap();
        std::fs::write(data.path().join("1.ans"), "something else\n").unwrap();
        let config = fake_limiter(ok_record_script());
        let limiter = Limiter::new(&config);
        let lang = lang();
        let ws = Workspace::prepare(&lang, "").unwrap();

        let result = run_case(&lang, &limiter, &ws, data.path(), &case_spec(), "", "");
        assert_eq!(result.status, ExeStatus::WrongAnswer);
        assert_eq!(result.score, 0);
    }

    #[test]
    fn limiter_status_maps_to_wire_status() {
        let data = tempfile::tempdir().unwrap();
        std::fs::write(data.path().join("1.in"), "").unwrap();
        std::fs::write(data.path().join("1.ans"), "x\n").unwrap();
        // status 3 = time limit exceeded
        let script = concat!(
            "printf '\\003\\000\\000\\000",
            "\\000\\000\\000\\000",
            "\\000\\000\\000\\000",
            "\\000\\000\\000\\000' > {result-file}"
        );
        let config = fake_limiter(script);
        let limiter = Limiter::new(&config);
        let lang = lang();
        let ws = Workspace::prepare(&lang, "").unwrap();

        let result = run_case(&lang, &limiter, &ws, data.path(), &case_spec(), "", "");
        assert_eq!(result.status, ExeStatus::TimeLimitExceeded);
        assert_eq!(result.score, 0);
    }

    #[test]
    fn named_input_is_copied_into_the_workdir() {
        let data = tempfile::tempdir().unwrap();
        std::fs::write(data.path().join("1.in"), "42\n").unwrap();
        std::fs::write(data.path().join("1.ans"), "correct\n").unwrap();
        let config = fake_limiter(ok_record_script());
        let limiter = Limiter::new(&config);
        let lang = lang();
        let ws = Workspace::prepare(&lang, "").unwrap();

        let result = run_case(&lang, &limiter, &ws, data.path(), &case_spec(), "task.in", "");
        assert_eq!(result.status, ExeStatus::Correct);
        assert_eq!(
            std::fs::read(ws.path().join("task.in")).unwrap(),
            b"42\n".to_vec()
        );
    }
}
