//! Script-writer processor (§4.2): builds a reduction script from a
//! template, or installs a default script, instead of running a job
//! handler. Reports a single status message to an instrument-templated
//! topic, and never emits a `started` transition (§4.2, "does not consume
//! a data file").

use super::{Processor, ProcessorOutcome};
use crate::config::FilesystemConfig;
use crate::model::{JobMessage, StatusOutcome};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::path::PathBuf;

pub struct ScriptWriterProcessor {
    input_destination: String,
    status_topic_template: String,
    fallback_error_destination: String,
    filesystem: FilesystemConfig,
}

impl ScriptWriterProcessor {
    pub fn new(
        input_destination: impl Into<String>,
        status_topic_template: impl Into<String>,
        fallback_error_destination: impl Into<String>,
        filesystem: FilesystemConfig,
    ) -> Self {
        Self {
            input_destination: input_destination.into(),
            status_topic_template: status_topic_template.into(),
            fallback_error_destination: fallback_error_destination.into(),
            filesystem,
        }
    }

    fn status_destination(&self, instrument: &str) -> String {
        self.status_topic_template.replace("${instrument}", instrument)
    }

    fn autoreduction_dir(&self, instrument: &str) -> PathBuf {
        match &self.filesystem.instrument_shared_root {
            Some(root) => root.join(instrument).join("shared/autoreduce"),
            None => PathBuf::from(format!("/SNS/{instrument}/shared/autoreduce")),
        }
    }

    fn write_from_template(&self, instrument: &str, template_data: &Value) -> Result<(), String> {
        let dir = self.autoreduction_dir(instrument);
        let template_path = dir.join(format!("reduce_{instrument}.py.template"));
        let contents = std::fs::read_to_string(&template_path).map_err(|e| {
            format!("could not find template reduce_{instrument}.py.template: {e}")
        })?;

        let substituted = substitute_template(&contents, template_data)?;
        if !dir.is_dir() {
            return Err(format!("script directory does not exist: {}", dir.display()));
        }
        std::fs::write(dir.join(format!("reduce_{instrument}.py")), substituted)
            .map_err(|e| format!("could not write reduction script: {e}"))
    }

    fn install_default(&self, instrument: &str) -> Result<(), String> {
        let dir = self.autoreduction_dir(instrument);
        let default_path = dir.join(format!("reduce_{instrument}_default.py"));
        if !default_path.is_file() {
            return Err(format!("could not find default script reduce_{instrument}_default.py"));
        }
        std::fs::copy(&default_path, dir.join(format!("reduce_{instrument}.py")))
            .map(|_| ())
            .map_err(|e| format!("could not install default script: {e}"))
    }
}

/// Substitutes `$name` / `${name}` placeholders against a JSON object,
/// mirroring `string.Template.substitute`'s missing-argument behavior
/// (§4.2, "reduction_script_writer.py's template-substitution behavior is
/// folded into ScriptWriterProcessor").
fn substitute_template(template: &str, data: &Value) -> Result<String, String> {
    let obj = data
        .as_object()
        .ok_or_else(|| "template_data must be a JSON object".to_string())?;
    let pattern = Regex::new(r"\$\{(\w+)\}|\$(\w+)").expect("valid regex");

    let missing: Vec<&str> = pattern
        .captures_iter(template)
        .map(|c| c.get(1).or_else(|| c.get(2)).unwrap().as_str())
        .filter(|name| !obj.contains_key(*name))
        .collect();
    if !missing.is_empty() {
        return Err(format!("template arguments missing: {}", missing.join(", ")));
    }

    let mut out = String::with_capacity(template.len());
    let mut last_end = 0;
    for captures in pattern.captures_iter(template) {
        let whole = captures.get(0).expect("whole match always present");
        out.push_str(&template[last_end..whole.start()]);
        let name = captures.get(1).or_else(|| captures.get(2)).unwrap().as_str();
        out.push_str(&template_value_string(&obj[name]));
        last_end = whole.end();
    }
    out.push_str(&template[last_end..]);
    Ok(out)
}

fn template_value_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Processor for ScriptWriterProcessor {
    fn input_destination(&self) -> &str {
        &self.input_destination
    }
    fn started_destination(&self) -> &str {
        &self.status_topic_template
    }
    fn complete_destination(&self) -> &str {
        &self.status_topic_template
    }
    fn error_destination(&self) -> &str {
        &self.fallback_error_destination
    }

    /// Never announces a `started` transition; it does one thing and
    /// reports once (§4.2).
    fn validate(&self, message: &JobMessage) -> Result<(), String> {
        if message.instrument().is_none() {
            return Err("instrument is missing".to_string());
        }
        // Required unconditionally, matching reduction_script_writer.py's
        // `process_request`, which gates its entire body on the key's
        // presence before it ever looks at `use_default`. Its contents just
        // go unused on the use_default=true path.
        if message.template_data().is_none() {
            return Err("template_data is missing".to_string());
        }
        Ok(())
    }

    async fn handle(&self, message: &JobMessage) -> Vec<ProcessorOutcome> {
        // `validate` has already confirmed the instrument is present.
        let instrument = message.instrument().unwrap_or_default();
        let destination = self.status_destination(&instrument);

        let result = if message.use_default() {
            self.install_default(&instrument)
                .map(|_| format!("Installed default {instrument} script"))
        } else {
            match message.template_data() {
                Some(data) => self
                    .write_from_template(&instrument, data)
                    .map(|_| format!("Created {instrument} reduction script")),
                None => Err("template data is missing".to_string()),
            }
        };

        let outcome = match result {
            Ok(status) => ProcessorOutcome {
                destination,
                outcome: StatusOutcome::Complete {
                    information: Some(status),
                },
                spawned_pid: None,
            },
            Err(reason) => ProcessorOutcome {
                destination,
                outcome: StatusOutcome::Error {
                    reason: format!("Error creating {instrument} reduction script: {reason}"),
                },
                spawned_pid: None,
            },
        };
        vec![outcome]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(fields: Value) -> JobMessage {
        JobMessage::from_bytes(fields.to_string().as_bytes()).unwrap()
    }

    fn processor(filesystem: FilesystemConfig) -> ScriptWriterProcessor {
        ScriptWriterProcessor::new(
            "/queue/REDUCTION.CREATE_SCRIPT",
            "/topic/SNS.${instrument}.STATUS.POSTPROCESS",
            "postprocess_error",
            filesystem,
        )
    }

    #[test]
    fn substitutes_simple_placeholders() {
        let data = json!({"facility": "SNS", "run": 5});
        let out = substitute_template("facility=$facility run=${run}", &data).unwrap();
        assert_eq!(out, "facility=SNS run=5");
    }

    #[test]
    fn missing_placeholder_is_an_error() {
        let data = json!({"facility": "SNS"});
        let err = substitute_template("facility=$facility run=$run", &data).unwrap_err();
        assert!(err.contains("run"));
    }

    #[test]
    fn missing_instrument_fails_validation() {
        let p = processor(FilesystemConfig::default());
        let msg = message(json!({"use_default": true}));
        assert!(p.validate(&msg).is_err());
    }

    #[tokio::test]
    async fn writes_script_from_template() {
        let tmp = tempfile::tempdir().unwrap();
        let mut filesystem = FilesystemConfig::default();
        filesystem.instrument_shared_root = Some(tmp.path().to_path_buf());

        let dir = tmp.path().join("EQSANS/shared/autoreduce");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("reduce_EQSANS.py.template"), "facility=$facility").unwrap();

        let p = processor(filesystem);
        let msg = message(json!({
            "instrument": "eqsans",
            "template_data": {"facility": "SNS"},
        }));
        let transitions = p.handle(&msg).await;
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].destination, "/topic/SNS.EQSANS.STATUS.POSTPROCESS");
        match &transitions[0].outcome {
            StatusOutcome::Complete { information } => {
                assert!(information.clone().unwrap().contains("Created"));
            }
            _ => panic!("expected complete outcome"),
        }
        let written = std::fs::read_to_string(dir.join("reduce_EQSANS.py")).unwrap();
        assert_eq!(written, "facility=SNS");
    }

    #[tokio::test]
    async fn installs_default_script() {
        let tmp = tempfile::tempdir().unwrap();
        let mut filesystem = FilesystemConfig::default();
        filesystem.instrument_shared_root = Some(tmp.path().to_path_buf());

        let dir = tmp.path().join("EQSANS/shared/autoreduce");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("reduce_EQSANS_default.py"), "# default").unwrap();

        let p = processor(filesystem);
        let msg = message(json!({
            "instrument": "EQSANS",
            "use_default": true,
            "template_data": {},
        }));
        let transitions = p.handle(&msg).await;
        match &transitions[0].outcome {
            StatusOutcome::Complete { information } => {
                assert!(information.clone().unwrap().contains("Installed default"));
            }
            _ => panic!("expected complete outcome"),
        }
        assert!(dir.join("reduce_EQSANS.py").is_file());
    }

    #[tokio::test]
    async fn missing_default_script_reports_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut filesystem = FilesystemConfig::default();
        filesystem.instrument_shared_root = Some(tmp.path().to_path_buf());
        std::fs::create_dir_all(tmp.path().join("EQSANS/shared/autoreduce")).unwrap();

        let p = processor(filesystem);
        let msg = message(json!({
            "instrument": "EQSANS",
            "use_default": true,
            "template_data": {},
        }));
        let transitions = p.handle(&msg).await;
        assert!(matches!(transitions[0].outcome, StatusOutcome::Error { .. }));
    }
}
