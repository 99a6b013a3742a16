//! Speech engines backed by worker processes.
//!
//! Both launch lazily on first use and respawn after their process dies.
//! `sre` is configured with a setup call before every request; `mathcat`
//! only re-sends its preferences when they differ from the last set it
//! accepted.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::application::render::{EngineError, SpeechEngine};
use crate::cache::mutex_lock;
use crate::domain::options::{SpeechEngineKind, SpeechOptions};

use super::worker::{WorkerCommand, WorkerProcess};

const SOURCE: &str = "mathgate::infra::engines::speech";

struct LazyWorker {
    command: WorkerCommand,
    process: tokio::sync::Mutex<Option<Arc<WorkerProcess>>>,
}

impl LazyWorker {
    fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            process: tokio::sync::Mutex::new(None),
        }
    }

    /// Current process, spawning one if none is alive.
    async fn get(&self) -> Result<Arc<WorkerProcess>, EngineError> {
        let mut slot = self.process.lock().await;
        let process = match slot.as_ref() {
            Some(process) => Arc::clone(process),
            None => {
                let process = Arc::new(WorkerProcess::spawn(&self.command, &[])?);
                *slot = Some(Arc::clone(&process));
                process
            }
        };
        if let Err(err) = process.wait_ready().await {
            *slot = None;
            drop(slot);
            process.kill().await;
            return Err(err);
        }
        Ok(process)
    }

    /// Forget `process` after `err` if the error means it is gone.
    ///
    /// Returns whether it was dropped; the next [`LazyWorker::get`] spawns
    /// a replacement.
    async fn discard_if_gone(&self, process: &Arc<WorkerProcess>, err: &EngineError) -> bool {
        if !err.is_disconnected() {
            return false;
        }
        let mut slot = self.process.lock().await;
        if slot
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, process))
        {
            *slot = None;
            warn!(
                target = SOURCE,
                worker = %self.command.program,
                error = %err,
                "speech worker lost, respawning on next request"
            );
        }
        drop(slot);
        process.kill().await;
        true
    }

    async fn kill(&self) {
        let process = self.process.lock().await.take();
        if let Some(process) = process {
            process.kill().await;
        }
    }
}

fn spoken_text(result: Value) -> Result<String, EngineError> {
    match result {
        Value::String(text) => Ok(text),
        other => Err(EngineError::protocol(format!(
            "expected speech text, got {other}"
        ))),
    }
}

pub struct SreSpeech {
    worker: LazyWorker,
}

impl SreSpeech {
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            worker: LazyWorker::new(command),
        }
    }

    pub async fn shutdown(&self) {
        self.worker.kill().await;
    }
}

#[async_trait]
impl SpeechEngine for SreSpeech {
    fn kind(&self) -> SpeechEngineKind {
        SpeechEngineKind::Sre
    }

    async fn speak(&self, mathml: &str, options: &SpeechOptions) -> Result<String, EngineError> {
        let worker = self.worker.get().await?;
        let result = async {
            worker
                .call(
                    "setup",
                    json!({
                        "domain": options.style,
                        "style": options.verbosity,
                        "locale": options.locale,
                    }),
                )
                .await?;
            worker.call("speak", json!({ "mathml": mathml })).await
        }
        .await;
        match result {
            Ok(result) => spoken_text(result),
            Err(err) => {
                self.worker.discard_if_gone(&worker, &err).await;
                Err(err)
            }
        }
    }
}

/// Preferences last accepted by the mathcat worker.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AppliedPreferences {
    style: String,
    verbosity: String,
    locale: String,
}

impl AppliedPreferences {
    fn matches(&self, options: &SpeechOptions) -> bool {
        self.style == options.style
            && self.verbosity == options.verbosity
            && self.locale == options.locale
    }
}

pub struct MathCatSpeech {
    worker: LazyWorker,
    applied: Mutex<Option<AppliedPreferences>>,
}

impl MathCatSpeech {
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            worker: LazyWorker::new(command),
            applied: Mutex::new(None),
        }
    }

    pub async fn shutdown(&self) {
        self.worker.kill().await;
    }

    async fn apply_preferences(
        &self,
        worker: &WorkerProcess,
        options: &SpeechOptions,
    ) -> Result<(), EngineError> {
        let current = mutex_lock(&self.applied, SOURCE, "read_preferences").clone();
        if current.as_ref().is_some_and(|applied| applied.matches(options)) {
            return Ok(());
        }

        debug!(
            target = SOURCE,
            style = %options.style,
            verbosity = %options.verbosity,
            locale = %options.locale,
            "applying mathcat preferences"
        );
        // Forget the record first so a failed update is retried next time.
        *mutex_lock(&self.applied, SOURCE, "forget_preferences") = None;
        worker
            .call(
                "prefs",
                json!({
                    "SpeechStyle": options.style,
                    "Verbosity": options.verbosity,
                    "Language": options.locale,
                }),
            )
            .await?;
        *mutex_lock(&self.applied, SOURCE, "record_preferences") = Some(AppliedPreferences {
            style: options.style.clone(),
            verbosity: options.verbosity.clone(),
            locale: options.locale.clone(),
        });
        Ok(())
    }
}

#[async_trait]
impl SpeechEngine for MathCatSpeech {
    fn kind(&self) -> SpeechEngineKind {
        SpeechEngineKind::MathCat
    }

    async fn speak(&self, mathml: &str, options: &SpeechOptions) -> Result<String, EngineError> {
        let worker = self.worker.get().await?;
        let result = async {
            self.apply_preferences(&worker, options).await?;
            worker.call("speak", json!({ "mathml": mathml })).await
        }
        .await;
        match result {
            Ok(result) => spoken_text(result),
            Err(err) => {
                // A fresh process starts without the preferences.
                if self.worker.discard_if_gone(&worker, &err).await {
                    *mutex_lock(&self.applied, SOURCE, "reset_preferences") = None;
                }
                Err(err)
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::infra::engines::worker::test_support::{echo_worker, read_log, script};

    const MATHML: &str = "<math><mi>x</mi></math>";

    fn mathcat_options(style: &str, verbosity: &str) -> SpeechOptions {
        SpeechOptions::new(SpeechEngineKind::MathCat, Some(style), Some(verbosity), Some("en"))
            .expect("valid options")
    }

    #[tokio::test]
    async fn sre_sets_up_before_every_request() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("sre.log");
        let path = script(&dir, "sre.sh", &echo_worker(&log, "\"x\""));
        let sre = SreSpeech::new(WorkerCommand::new(path.display().to_string(), Vec::new()));

        let options = SpeechOptions::default();
        assert_eq!(sre.speak(MATHML, &options).await.expect("speak"), "x");
        assert_eq!(sre.speak(MATHML, &options).await.expect("speak"), "x");
        sre.shutdown().await;

        let ops: Vec<String> = read_log(&log).into_iter().skip(1).collect();
        assert_eq!(ops, ["setup", "speak", "setup", "speak"]);
    }

    #[tokio::test]
    async fn mathcat_reapplies_preferences_only_on_change() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("mathcat.log");
        let path = script(&dir, "mathcat.sh", &echo_worker(&log, "\"x\""));
        let mathcat =
            MathCatSpeech::new(WorkerCommand::new(path.display().to_string(), Vec::new()));

        let terse = mathcat_options("ClearSpeak", "Terse");
        let verbose = mathcat_options("ClearSpeak", "Verbose");
        mathcat.speak(MATHML, &terse).await.expect("speak");
        mathcat.speak(MATHML, &terse).await.expect("speak");
        mathcat.speak(MATHML, &verbose).await.expect("speak");
        mathcat.speak(MATHML, &verbose).await.expect("speak");
        mathcat.shutdown().await;

        let ops: Vec<String> = read_log(&log).into_iter().skip(1).collect();
        assert_eq!(
            ops,
            ["prefs", "speak", "speak", "prefs", "speak", "speak"]
        );
    }

    /// Worker that answers `answers` requests, then exits.
    fn short_lived_worker(log: &std::path::Path, answers: usize) -> String {
        format!(
            r#"echo start >> "{log}"
echo '{{"ready":true}}'
n=0
while [ "$n" -lt {answers} ] && IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  op=$(printf '%s' "$line" | sed -n 's/.*"op":"\([a-z]*\)".*/\1/p')
  echo "$op" >> "{log}"
  printf '{{"id":%s,"ok":true,"result":"x"}}\n' "$id"
  n=$((n + 1))
done
"#,
            log = log.display(),
        )
    }

    #[tokio::test]
    async fn sre_respawns_after_worker_exits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("sre.log");
        let path = script(&dir, "sre.sh", &short_lived_worker(&log, 2));
        let sre = SreSpeech::new(WorkerCommand::new(path.display().to_string(), Vec::new()));
        let options = SpeechOptions::default();

        assert_eq!(sre.speak(MATHML, &options).await.expect("first"), "x");
        let err = sre.speak(MATHML, &options).await.expect_err("worker exited");
        assert!(err.is_disconnected());
        assert_eq!(sre.speak(MATHML, &options).await.expect("respawned"), "x");
        sre.shutdown().await;

        let starts = read_log(&log).iter().filter(|line| *line == "start").count();
        assert_eq!(starts, 2);
    }

    #[tokio::test]
    async fn mathcat_resends_preferences_to_respawned_worker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("mathcat.log");
        let path = script(&dir, "mathcat.sh", &short_lived_worker(&log, 2));
        let mathcat =
            MathCatSpeech::new(WorkerCommand::new(path.display().to_string(), Vec::new()));
        let terse = mathcat_options("ClearSpeak", "Terse");

        mathcat.speak(MATHML, &terse).await.expect("first");
        assert!(mathcat.speak(MATHML, &terse).await.is_err());
        mathcat.speak(MATHML, &terse).await.expect("respawned");
        mathcat.shutdown().await;

        assert_eq!(
            read_log(&log),
            ["start", "prefs", "speak", "start", "prefs", "speak"]
        );
    }

    #[tokio::test]
    async fn non_text_result_is_a_protocol_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("odd.log");
        let path = script(&dir, "odd.sh", &echo_worker(&log, "42"));
        let sre = SreSpeech::new(WorkerCommand::new(path.display().to_string(), Vec::new()));
        let err = sre
            .speak(MATHML, &SpeechOptions::default())
            .await
            .expect_err("number is not speech");
        assert!(matches!(err, EngineError::Protocol { .. }));
        sre.shutdown().await;
    }
}
