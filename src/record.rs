use crate::ipfix::{Exporter, FieldSpec, Template};
use anyhow::Context;
use serde::Deserialize;
use std::path::PathBuf;

/// How a sourced string value is turned into its IPFIX wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transform {
    Ignore,
    Int,
    String,
    Ip,
    Mac,
    Float,
    Double,
    Percent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordField {
    pub ie: u16,
    pub length: u16,
    #[serde(default)]
    pub enterprise: Option<u32>,
    pub transform: Transform,
    /// Literal value; mutually exclusive with `file`.
    #[serde(default)]
    pub value: Option<String>,
    /// File whose trimmed contents provide the value.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordDescriptor {
    pub template_id: u16,
    pub fields: Vec<RecordField>,
}

impl RecordField {
    pub fn source(&self) -> anyhow::Result<String> {
        match (&self.value, &self.file) {
            (Some(value), None) => Ok(value.clone()),
            (None, Some(path)) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read record source {}", path.display()))?;
                Ok(raw.trim().to_string())
            }
            _ => anyhow::bail!(
                "record field {} must set exactly one of value/file",
                self.ie
            ),
        }
    }

    /// Renders the sourced value into exactly `length` bytes, multi-byte
    /// integers in network byte order.
    pub fn render(&self) -> anyhow::Result<Vec<u8>> {
        let input = self.source()?;
        let length = self.length as usize;

        let bytes = match self.transform {
            Transform::Ignore => vec![0u8; length],
            Transform::Int => {
                let value: i32 = input
                    .parse()
                    .with_context(|| format!("invalid integer {:?}", input))?;
                value.to_be_bytes().to_vec()
            }
            Transform::String => {
                let mut out = input.into_bytes();
                out.truncate(length.saturating_sub(1));
                out.resize(length, 0);
                out
            }
            Transform::Ip => {
                let addr: std::net::Ipv4Addr = input
                    .parse()
                    .with_context(|| format!("invalid IPv4 address {:?}", input))?;
                addr.octets().to_vec()
            }
            Transform::Mac => {
                let addr: macaddr::MacAddr6 = input
                    .parse()
                    .with_context(|| format!("invalid MAC address {:?}", input))?;
                addr.into_array().to_vec()
            }
            Transform::Float => {
                let value: f32 = input
                    .parse()
                    .with_context(|| format!("invalid float {:?}", input))?;
                value.to_be_bytes().to_vec()
            }
            Transform::Double => {
                let value: f64 = input
                    .parse()
                    .with_context(|| format!("invalid double {:?}", input))?;
                value.to_be_bytes().to_vec()
            }
            Transform::Percent => {
                let value: f32 = input
                    .parse()
                    .with_context(|| format!("invalid percentage {:?}", input))?;
                (value * 0.01).to_be_bytes().to_vec()
            }
        };

        anyhow::ensure!(
            bytes.len() == length,
            "field {} renders {} bytes but declares {}",
            self.ie,
            bytes.len(),
            length
        );
        Ok(bytes)
    }
}

pub fn declare_record_templates(
    exporter: &mut Exporter,
    records: &[RecordDescriptor],
) -> anyhow::Result<()> {
    for descriptor in records {
        let fields = descriptor
            .fields
            .iter()
            .map(|f| FieldSpec {
                id: f.ie,
                length: f.length,
                enterprise: f.enterprise,
            })
            .collect();
        exporter.declare_template(Template::new(descriptor.template_id, fields))?;
    }
    Ok(())
}

/// Emits one data record per configured descriptor. A descriptor whose
/// fields fail to render is abandoned and the remaining descriptors proceed.
pub fn export_records(exporter: &mut Exporter, records: &[RecordDescriptor]) -> anyhow::Result<()> {
    for descriptor in records {
        // Render everything up front so a failure never leaves a set half
        // written.
        let rendered: anyhow::Result<Vec<Vec<u8>>> =
            descriptor.fields.iter().map(|f| f.render()).collect();
        let rendered = match rendered {
            Ok(rendered) => rendered,
            Err(err) => {
                tracing::error!(
                    "skipping record template {}: {}",
                    descriptor.template_id,
                    err
                );
                continue;
            }
        };

        exporter.start_data_set(descriptor.template_id)?;
        for bytes in &rendered {
            exporter.put_bytes(bytes);
        }
        exporter.end_data_set()?;
    }

    exporter.send_message()
}
