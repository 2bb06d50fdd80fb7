use crate::record::RecordDescriptor;
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tokio::process::{Child, Command};

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Rewrites the status XML file on every record-export cycle and drives the
/// optional post-processing command. At most one post-processing child is
/// outstanding; a straggler from the previous cycle is killed first.
pub struct XmlExport {
    path: PathBuf,
    postprocessing: Option<String>,
    child: Option<Child>,
}

impl XmlExport {
    pub fn new(path: impl Into<PathBuf>, postprocessing: Option<String>) -> Self {
        Self {
            path: path.into(),
            postprocessing,
            child: None,
        }
    }

    pub fn update(
        &mut self,
        records: &[RecordDescriptor],
        flow_count: usize,
        node_count: usize,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let rendered = render(records, flow_count, node_count, now);
        std::fs::write(&self.path, rendered)
            .with_context(|| format!("failed to rewrite XML file {}", self.path.display()))?;

        self.postprocess();
        Ok(())
    }

    fn postprocess(&mut self) {
        let command = match &self.postprocessing {
            Some(command) => command.clone(),
            None => return,
        };

        if let Some(child) = &mut self.child {
            match child.try_wait() {
                Ok(Some(_)) => self.child = None,
                Ok(None) => {
                    tracing::error!("XML postprocessing has not terminated in time, killing it");
                    if let Err(err) = child.start_kill() {
                        tracing::error!("failed to kill XML postprocessing child: {}", err);
                    }
                    self.child = None;
                }
                Err(err) => {
                    tracing::error!("failed to check XML postprocessing child: {}", err);
                    self.child = None;
                }
            }
        }

        match Command::new("/bin/sh").arg("-c").arg(&command).spawn() {
            Ok(child) => {
                tracing::info!("triggered XML postprocessing");
                self.child = Some(child);
            }
            Err(err) => {
                tracing::error!("could not spawn XML postprocessing, skipped: {}", err);
            }
        }
    }
}

fn render(
    records: &[RecordDescriptor],
    flow_count: usize,
    node_count: usize,
    now: DateTime<Utc>,
) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    let _ = writeln!(
        out,
        "<status timestamp=\"{}\" flows=\"{}\" nodes=\"{}\">",
        now.to_rfc3339(),
        flow_count,
        node_count
    );

    for descriptor in records {
        let _ = writeln!(out, "  <record template=\"{}\">", descriptor.template_id);
        for field in &descriptor.fields {
            let value = field.source().unwrap_or_else(|err| {
                tracing::error!("failed to source record field {}: {}", field.ie, err);
                String::new()
            });
            let _ = writeln!(
                out,
                "    <field ie=\"{}\">{}</field>",
                field.ie,
                escape(&value)
            );
        }
        out.push_str("  </record>\n");
    }

    out.push_str("</status>\n");
    out
}
