//! Manifest rendering
//!
//! Job and PVC manifests are YAML templates embedded at compile time and
//! rendered with minijinja. Every interpolated value goes through `tojson`, so
//! the output is always valid YAML regardless of what the caller put in names,
//! images or environment values. The rendered text is deserialized straight
//! into `k8s-openapi` types.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use minijinja::{context, Environment, UndefinedBehavior, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::record::{Record, ResourceRequirements};
use crate::{Error, Result, MANAGED_BY};

/// Primary job template
pub const JOB_TEMPLATE: &str = "job.yaml";
/// Cleanup job template
pub const CLEANUP_JOB_TEMPLATE: &str = "cleanup_job.yaml";
/// PersistentVolumeClaim template
pub const PVC_TEMPLATE: &str = "pvc.yaml";

/// Image used for the input fetch init container and the cleanup job
pub const DEFAULT_STORAGE_TOOL_IMAGE: &str = "google/cloud-sdk:slim";

/// Deployment-wide values every manifest needs
#[derive(Clone, Debug, Serialize)]
pub struct ManifestSettings {
    /// Namespace resources are created in
    pub namespace: String,
    /// Bucket job input and output live in
    pub bucket_name: String,
    /// Secret holding the storage credentials
    pub credentials_secret: String,
    /// Key of the credentials file inside that secret
    pub credentials_filename: String,
    /// Pod retries before the Job is marked failed
    pub backoff_limit: i32,
    /// Image with the storage CLI
    pub storage_tool_image: String,
}

#[derive(Serialize)]
struct JobValues<'a> {
    name: &'a str,
    image: &'a str,
    environment: &'a BTreeMap<String, String>,
    resources: &'a ResourceRequirements,
    output_pvc: String,
    input_pvc: Option<String>,
    fetch_script: String,
}

#[derive(Serialize)]
struct CleanupValues<'a> {
    name: String,
    primary: &'a str,
    output_pvc: String,
    publish_script: String,
}

/// Renders the embedded manifest templates
pub struct ManifestRenderer {
    env: Environment<'static>,
}

impl ManifestRenderer {
    /// Load the embedded templates
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        for (name, source) in [
            (JOB_TEMPLATE, include_str!("../templates/job.yaml")),
            (CLEANUP_JOB_TEMPLATE, include_str!("../templates/cleanup_job.yaml")),
            (PVC_TEMPLATE, include_str!("../templates/pvc.yaml")),
        ] {
            env.add_template(name, source)
                .map_err(|e| Error::template(name, e.to_string()))?;
        }

        Ok(Self { env })
    }

    /// Render a named template to text
    pub fn render(&self, template: &str, ctx: Value) -> Result<String> {
        self.env
            .get_template(template)
            .and_then(|t| t.render(ctx))
            .map_err(|e| Error::template(template, e.to_string()))
    }

    /// The primary Job for `record`
    pub fn job(&self, record: &Record, settings: &ManifestSettings) -> Result<Job> {
        let params = &record.job_parameters;
        let input_pvc = record.has_input_file().then(|| record.input_pvc_name());
        let fetch_script = if input_pvc.is_some() {
            format!(
                "{auth} && gsutil cp gs://{bucket}/{key} /tmp/input.zip && python3 -m zipfile -e /tmp/input.zip /input/",
                auth = auth_command(settings),
                bucket = settings.bucket_name,
                key = record.input_object_key(),
            )
        } else {
            String::new()
        };

        let values = JobValues {
            name: &record.name,
            image: &params.docker_image,
            environment: &params.environment_variables,
            resources: &params.resources,
            output_pvc: record.output_pvc_name(),
            input_pvc,
            fetch_script,
        };

        self.render_into(
            JOB_TEMPLATE,
            context! { job => values, settings => settings, managed_by => MANAGED_BY },
        )
    }

    /// The cleanup Job that publishes `record`'s output
    pub fn cleanup_job(&self, record: &Record, settings: &ManifestSettings) -> Result<Job> {
        let key = record.output_object_key();
        let publish_script = format!(
            "{auth} && python3 -m zipfile -c /tmp/{key} /output/ && gsutil cp /tmp/{key} gs://{bucket}/{key}",
            auth = auth_command(settings),
            bucket = settings.bucket_name,
            key = key,
        );

        let values = CleanupValues {
            name: record.cleanup_job_name(),
            primary: &record.name,
            output_pvc: record.output_pvc_name(),
            publish_script,
        };

        self.render_into(
            CLEANUP_JOB_TEMPLATE,
            context! { job => values, settings => settings, managed_by => MANAGED_BY },
        )
    }

    /// A PersistentVolumeClaim requesting `size`
    pub fn pvc(
        &self,
        name: &str,
        size: &str,
        settings: &ManifestSettings,
    ) -> Result<PersistentVolumeClaim> {
        self.render_into(
            PVC_TEMPLATE,
            context! { name => name, size => size, settings => settings, managed_by => MANAGED_BY },
        )
    }

    fn render_into<T: DeserializeOwned>(&self, template: &str, ctx: Value) -> Result<T> {
        let rendered = self.render(template, ctx)?;
        serde_yaml::from_str(&rendered).map_err(|e| Error::template(template, e.to_string()))
    }
}

fn auth_command(settings: &ManifestSettings) -> String {
    format!(
        "gcloud auth activate-service-account --key-file=/secrets/{}",
        settings.credentials_filename
    )
}
