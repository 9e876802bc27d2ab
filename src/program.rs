//! The web-service stack
//!
//! A containerised service behind an application load balancer: network,
//! security group, target group and listener, an image registry with the
//! application image, logging, an ECS-style cluster with its execution role,
//! a task definition and the service itself. The load balancer address is
//! exported as `url`.

use crate::config::StackConfig;
use declarative::{DeclarationError, Input, ResourceKind, SecretSource, Stack};
use serde_json::{Value, json};
use std::sync::Arc;

const TASK_EXECUTION_POLICY: &str =
    "arn:aws:iam::aws:policy/service-role/AmazonECSTaskExecutionRolePolicy";

pub fn web_service(
    config: &StackConfig,
    secrets: Arc<dyn SecretSource>,
) -> Result<Stack, DeclarationError> {
    let mut stack = Stack::new(&config.name);
    let port = i64::from(config.container_port);

    // Networking
    let vpc = stack.resource(
        "vpc",
        ResourceKind::Vpc,
        [
            ("cidr_block", json!(config.vpc_cidr)),
            ("enable_dns_hostnames", json!(true)),
            ("subnet_strategy", json!("auto")),
        ],
    )?;
    let public_subnets = vpc.output("public_subnet_ids")?;

    let target_group = stack.resource(
        "target-group",
        ResourceKind::TargetGroup,
        [
            ("port", Input::from(json!(port))),
            ("protocol", "HTTP".into()),
            ("target_type", "ip".into()),
            ("ip_address_type", "ipv4".into()),
            ("vpc_id", vpc.output("id")?.into()),
        ],
    )?;

    let security_group = stack.resource(
        "web-sg",
        ResourceKind::SecurityGroup,
        [
            ("description", Input::from("HTTP ingress, unrestricted egress")),
            ("vpc_id", vpc.output("id")?.into()),
            (
                "ingress",
                json!([{
                    "protocol": "tcp",
                    "from_port": port,
                    "to_port": port,
                    "cidr_blocks": ["0.0.0.0/0"],
                }])
                .into(),
            ),
            (
                "egress",
                json!([{
                    "protocol": "-1",
                    "from_port": 0,
                    "to_port": 0,
                    "cidr_blocks": ["0.0.0.0/0"],
                }])
                .into(),
            ),
        ],
    )?;
    let security_groups = security_group.output("id")?.map(|id| json!([id]));

    let alb = stack.resource(
        "alb",
        ResourceKind::LoadBalancer,
        [
            ("name", Input::from(format!("{}-alb", config.name))),
            ("internal", false.into()),
            ("load_balancer_type", "application".into()),
            ("ip_address_type", "ipv4".into()),
            ("subnets", public_subnets.clone().into()),
            ("security_groups", security_groups.clone().into()),
        ],
    )?;

    let forward = target_group
        .output("arn")?
        .map(|arn| json!([{ "type": "forward", "target_group_arn": arn }]));
    stack.resource(
        "alb-listener",
        ResourceKind::Listener,
        [
            ("load_balancer_arn", Input::from(alb.output("arn")?)),
            ("port", json!(port).into()),
            ("protocol", "HTTP".into()),
            ("default_actions", forward.into()),
        ],
    )?;

    // Image
    let repository = stack.resource(
        "repository",
        ResourceKind::Repository,
        [
            ("name", json!(format!("{}-repository", config.name))),
            ("scan_on_push", json!(true)),
        ],
    )?;
    let repository_url = repository.output("repository_url")?;
    let latest = repository_url.map(|url| json!(format!("{}:latest", url.as_str().unwrap_or_default())));
    let registry_password = stack.secret(secrets, &repository.output("registry_id")?);

    let image = stack.resource(
        "app-image",
        ResourceKind::Image,
        [
            ("image_name", Input::from(&latest)),
            ("context", "./".into()),
            ("dockerfile", "Dockerfile".into()),
            ("platform", config.platform.clone().into()),
            ("build_args", json!({ "BUILDKIT_INLINE_CACHE": "1" }).into()),
            ("cache_from", latest.map(|image| json!([image])).into()),
            ("registry_server", repository_url.into()),
            ("registry_username", "AWS".into()),
            ("registry_password", registry_password.into()),
        ],
    )?;

    // Runtime
    let log_group = stack.resource(
        "log-group",
        ResourceKind::LogGroup,
        [("name", json!(format!("/ecs/{}", config.name)))],
    )?;
    let log_group_name = log_group.output("name")?;

    let cluster = stack.resource(
        "cluster",
        ResourceKind::Cluster,
        [
            ("execute_command_logging", Input::from("OVERRIDE")),
            ("cloud_watch_encryption_enabled", true.into()),
            ("cloud_watch_log_group_name", log_group_name.clone().into()),
        ],
    )?;

    let role = stack.resource(
        "task-exec-role",
        ResourceKind::Role,
        [(
            "assume_role_policy",
            json!({
                "Version": "2012-10-17",
                "Statement": [{
                    "Effect": "Allow",
                    "Principal": { "Service": "ecs-tasks.amazonaws.com" },
                    "Action": "sts:AssumeRole",
                }],
            }),
        )],
    )?;
    stack.resource(
        "task-exec-policy",
        ResourceKind::RolePolicyAttachment,
        [
            ("role", Input::from(role.output("name")?)),
            ("policy_arn", TASK_EXECUTION_POLICY.into()),
        ],
    )?;

    let name = config.name.clone();
    let region = config.region.clone();
    let containers = image
        .output("image_name")?
        .combine(&log_group_name)
        .map(move |(image, group)| {
            Value::String(container_definitions(&name, &image, &group, port, &region))
        });

    let task = stack.resource(
        "task-definition",
        ResourceKind::TaskDefinition,
        [
            ("family", Input::from(format!("{}-task", config.name))),
            ("cpu", config.cpu.clone().into()),
            ("memory", config.memory.clone().into()),
            ("network_mode", "awsvpc".into()),
            ("requires_compatibilities", json!(["FARGATE"]).into()),
            ("execution_role_arn", role.output("arn")?.into()),
            ("container_definitions", containers.into()),
        ],
    )?;
    // Tasks cannot pull the image until the role carries the policy
    stack.depends_on("task-definition", "task-exec-policy")?;

    stack.resource(
        "service",
        ResourceKind::Service,
        [
            ("name", Input::from(format!("{}-service", config.name))),
            ("cluster", cluster.output("arn")?.into()),
            ("task_definition", task.output("arn")?.into()),
            ("desired_count", json!(config.desired_count).into()),
            ("launch_type", "FARGATE".into()),
            ("assign_public_ip", true.into()),
            ("subnets", public_subnets.into()),
            ("security_groups", security_groups.into()),
        ],
    )?;
    stack.depends_on("service", "alb-listener")?;

    stack.export("url", alb.output("dns_name")?)?;
    Ok(stack)
}

/// Container definitions document for the application container.
fn container_definitions(
    stack: &str,
    image: &Value,
    log_group: &Value,
    port: i64,
    region: &str,
) -> String {
    json!([{
        "name": format!("{stack}-app"),
        "image": image,
        "portMappings": [{
            "containerPort": port,
            "hostPort": port,
            "protocol": "tcp",
        }],
        "logConfiguration": {
            "logDriver": "awslogs",
            "options": {
                "awslogs-create-group": "true",
                "awslogs-group": log_group,
                "awslogs-region": region,
                "awslogs-stream-prefix": stack,
            },
        },
    }])
    .to_string()
}
