//! EC2 execution backend.
//!
//! The composed script ships as instance user-data: raw for an on-demand
//! instance, base64-encoded for a spot request. The `dry` dispatch flag
//! maps to the EC2 API's own `DryRun` validation mode, so the provider
//! checks the request without creating anything. Provider rejections are
//! propagated verbatim.

use std::future::Future;
use std::pin::Pin;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::Client;
use aws_sdk_ec2::error::DisplayErrorContext;
use aws_sdk_ec2::types::{
    IamInstanceProfileSpecification, InstanceType, RequestSpotLaunchSpecification,
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use thiserror::Error;

use crate::compose::LaunchScript;

use super::{DispatchOptions, LaunchError, LaunchHandle};

/// Settings for creating an EC2 instance that runs the script on boot.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Ec2Launch {
    /// Region the instance is created in.
    pub region: String,
    /// Machine image id (`ami-..`).
    pub image_id: String,
    /// Commercial instance type (for example `t3.medium`).
    pub instance_type: String,
    /// Key pair name for SSH access.
    pub key_name: String,
    /// Security group name.
    pub security_group: String,
    /// Optional IAM instance profile ARN attached to the instance.
    #[serde(default)]
    pub iam_instance_profile_arn: Option<String>,
    /// Maximum spot price; presence selects a spot request instead of an
    /// on-demand instance.
    #[serde(default)]
    pub spot_price: Option<f64>,
}

/// Descriptor of a created on-demand instance.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceDescriptor {
    /// Reservation id reported by the provider.
    pub reservation_id: Option<String>,
    /// Ids of the created instances.
    pub instance_ids: Vec<String>,
}

/// The cloud provider rejected the request; its message verbatim.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct ProviderError {
    /// Message returned by the provider SDK.
    pub message: String,
}

/// Future returned by instance launcher operations.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Minimal interface to the instance-creation API, implemented by the
/// AWS SDK wrapper and by fakes in tests.
pub trait InstanceLauncher {
    /// Creates an on-demand instance with `user_data` attached raw.
    fn run_instance<'a>(
        &'a self,
        request: &'a Ec2Launch,
        user_data: String,
        dry_run: bool,
    ) -> ProviderFuture<'a, InstanceDescriptor>;

    /// Files a spot request with base64-encoded `user_data`; returns the
    /// request id.
    fn request_spot<'a>(
        &'a self,
        request: &'a Ec2Launch,
        user_data: String,
        spot_price: String,
        dry_run: bool,
    ) -> ProviderFuture<'a, String>;
}

/// Instance launcher backed by the AWS EC2 SDK.
#[derive(Clone, Copy, Debug, Default)]
pub struct AwsEc2Launcher;

impl AwsEc2Launcher {
    /// Creates the launcher. Credentials come from the ambient AWS
    /// configuration chain.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    async fn client(region: &str) -> Client {
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_owned()))
            .load()
            .await;
        Client::new(&shared)
    }
}

impl InstanceLauncher for AwsEc2Launcher {
    fn run_instance<'a>(
        &'a self,
        request: &'a Ec2Launch,
        user_data: String,
        dry_run: bool,
    ) -> ProviderFuture<'a, InstanceDescriptor> {
        Box::pin(async move {
            let client = Self::client(&request.region).await;
            let mut call = client
                .run_instances()
                .image_id(&request.image_id)
                .instance_type(InstanceType::from(request.instance_type.as_str()))
                .key_name(&request.key_name)
                .security_groups(&request.security_group)
                .min_count(1)
                .max_count(1)
                .user_data(user_data)
                .dry_run(dry_run);
            if let Some(arn) = &request.iam_instance_profile_arn {
                call = call.iam_instance_profile(
                    IamInstanceProfileSpecification::builder().arn(arn).build(),
                );
            }
            let response = call.send().await.map_err(provider_error)?;
            Ok(InstanceDescriptor {
                reservation_id: response.reservation_id().map(str::to_owned),
                instance_ids: response
                    .instances()
                    .iter()
                    .filter_map(|instance| instance.instance_id().map(str::to_owned))
                    .collect(),
            })
        })
    }

    fn request_spot<'a>(
        &'a self,
        request: &'a Ec2Launch,
        user_data: String,
        spot_price: String,
        dry_run: bool,
    ) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            let client = Self::client(&request.region).await;
            let mut spec = RequestSpotLaunchSpecification::builder()
                .image_id(&request.image_id)
                .instance_type(InstanceType::from(request.instance_type.as_str()))
                .key_name(&request.key_name)
                .security_groups(&request.security_group)
                .user_data(user_data);
            if let Some(arn) = &request.iam_instance_profile_arn {
                spec = spec.iam_instance_profile(
                    IamInstanceProfileSpecification::builder().arn(arn).build(),
                );
            }
            let response = client
                .request_spot_instances()
                .instance_count(1)
                .spot_price(spot_price)
                .launch_specification(spec.build())
                .dry_run(dry_run)
                .send()
                .await
                .map_err(provider_error)?;
            response
                .spot_instance_requests()
                .first()
                .and_then(|req| req.spot_instance_request_id())
                .map(str::to_owned)
                .ok_or_else(|| ProviderError {
                    message: String::from("spot request response carried no request id"),
                })
        })
    }
}

fn provider_error<E>(err: E) -> ProviderError
where
    E: std::error::Error + Send + Sync + 'static,
{
    ProviderError {
        message: format!("{}", DisplayErrorContext(&err)),
    }
}

pub(super) async fn dispatch<L: InstanceLauncher>(
    launcher: &L,
    script: &LaunchScript,
    spec: &Ec2Launch,
    options: &DispatchOptions,
) -> Result<LaunchHandle, LaunchError> {
    if let Some(price) = spec.spot_price {
        let encoded = BASE64.encode(script.as_str().as_bytes());
        let request_id = launcher
            .request_spot(spec, encoded, format!("{price}"), options.dry)
            .await?;
        if options.verbose {
            tracing::info!(%request_id, region = %spec.region, "spot instance requested");
        }
        Ok(LaunchHandle::SpotRequest(request_id))
    } else {
        let descriptor = launcher
            .run_instance(spec, script.as_str().to_owned(), options.dry)
            .await?;
        if options.verbose {
            tracing::info!(
                instance_ids = ?descriptor.instance_ids,
                region = %spec.region,
                "instance launched"
            );
        }
        Ok(LaunchHandle::Instance(descriptor))
    }
}
