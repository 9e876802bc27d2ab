//! Resource kinds and their input/output schemas
//!
//! Every kind is a closed variant with a static schema. Inputs are checked
//! against it at declaration time (literal values) and again after
//! resolution (values that arrived through outputs).

use crate::error::DeclarationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Field Specs
// ============================================================================

/// Shape an input value must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Bool,
    StringList,
    Object,
    /// Free-form JSON (policies, rule lists)
    Any,
}

impl FieldType {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Bool => value.is_boolean(),
            Self::StringList => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
            Self::Object => value.is_object(),
            Self::Any => !value.is_null(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Bool => "bool",
            Self::StringList => "list of strings",
            Self::Object => "object",
            Self::Any => "value",
        }
    }
}

/// How a change to a field is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    /// Updated in place, physical identity kept
    Mutable,
    /// Requires delete + create under a new physical identity
    ForceNew,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
    pub required: bool,
    pub mutability: Mutability,
    pub secret: bool,
}

const fn field(name: &'static str, ty: FieldType) -> FieldSpec {
    FieldSpec {
        name,
        ty,
        required: false,
        mutability: Mutability::Mutable,
        secret: false,
    }
}

impl FieldSpec {
    const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    const fn force_new(mut self) -> Self {
        self.mutability = Mutability::ForceNew;
        self
    }

    const fn secret(mut self) -> Self {
        self.secret = true;
        self
    }
}

/// Static description of one resource kind.
#[derive(Debug)]
pub struct Schema {
    pub inputs: &'static [FieldSpec],
    pub outputs: &'static [&'static str],
}

impl Schema {
    pub fn input(&self, name: &str) -> Option<&FieldSpec> {
        self.inputs.iter().find(|f| f.name == name)
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.contains(&name)
    }

    pub fn secret_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.inputs.iter().filter(|f| f.secret).map(|f| f.name)
    }
}

// ============================================================================
// Resource Kinds
// ============================================================================

/// The closed set of resources a stack can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Vpc,
    SecurityGroup,
    TargetGroup,
    LoadBalancer,
    Listener,
    Repository,
    Image,
    LogGroup,
    Cluster,
    Role,
    RolePolicyAttachment,
    TaskDefinition,
    Service,
}

use FieldType::{Any, Bool, Integer, Object, StringList};

static VPC: Schema = Schema {
    inputs: &[
        field("cidr_block", FieldType::String).required().force_new(),
        field("enable_dns_hostnames", Bool),
        field("subnet_strategy", FieldType::String).force_new(),
        field("availability_zones", Integer).force_new(),
        field("tags", Object),
    ],
    outputs: &["id", "arn", "public_subnet_ids", "private_subnet_ids"],
};

static SECURITY_GROUP: Schema = Schema {
    inputs: &[
        field("description", FieldType::String).force_new(),
        field("vpc_id", FieldType::String).required().force_new(),
        field("ingress", Any),
        field("egress", Any),
        field("tags", Object),
    ],
    outputs: &["id", "arn", "name"],
};

static TARGET_GROUP: Schema = Schema {
    inputs: &[
        field("port", Integer).required().force_new(),
        field("protocol", FieldType::String).required().force_new(),
        field("target_type", FieldType::String).force_new(),
        field("ip_address_type", FieldType::String).force_new(),
        field("vpc_id", FieldType::String).required().force_new(),
        field("health_check", Object),
    ],
    outputs: &["id", "arn", "name"],
};

static LOAD_BALANCER: Schema = Schema {
    inputs: &[
        field("name", FieldType::String).force_new(),
        field("internal", Bool).force_new(),
        field("load_balancer_type", FieldType::String).force_new(),
        field("ip_address_type", FieldType::String),
        field("subnets", StringList).required(),
        field("security_groups", StringList),
    ],
    outputs: &["id", "arn", "dns_name", "zone_id"],
};

static LISTENER: Schema = Schema {
    inputs: &[
        field("load_balancer_arn", FieldType::String)
            .required()
            .force_new(),
        field("port", Integer).required(),
        field("protocol", FieldType::String),
        field("default_actions", Any).required(),
    ],
    outputs: &["id", "arn"],
};

static REPOSITORY: Schema = Schema {
    inputs: &[
        field("name", FieldType::String).required().force_new(),
        field("scan_on_push", Bool),
        field("force_delete", Bool),
    ],
    outputs: &["id", "arn", "repository_url", "registry_id"],
};

static IMAGE: Schema = Schema {
    inputs: &[
        field("image_name", FieldType::String).required(),
        field("context", FieldType::String).required(),
        field("dockerfile", FieldType::String),
        field("platform", FieldType::String),
        field("build_args", Object),
        field("cache_from", StringList),
        field("registry_server", FieldType::String),
        field("registry_username", FieldType::String),
        field("registry_password", FieldType::String).secret(),
    ],
    outputs: &["id", "image_name", "repo_digest"],
};

static LOG_GROUP: Schema = Schema {
    inputs: &[
        field("name", FieldType::String).force_new(),
        field("retention_in_days", Integer),
    ],
    outputs: &["id", "arn", "name"],
};

static CLUSTER: Schema = Schema {
    inputs: &[
        field("name", FieldType::String).force_new(),
        field("execute_command_logging", FieldType::String),
        field("cloud_watch_encryption_enabled", Bool),
        field("cloud_watch_log_group_name", FieldType::String),
    ],
    outputs: &["id", "arn", "name"],
};

static ROLE: Schema = Schema {
    inputs: &[
        field("name", FieldType::String).force_new(),
        field("assume_role_policy", Any).required(),
    ],
    outputs: &["id", "arn", "name"],
};

static ROLE_POLICY_ATTACHMENT: Schema = Schema {
    inputs: &[
        field("role", FieldType::String).required().force_new(),
        field("policy_arn", FieldType::String).required().force_new(),
    ],
    outputs: &["id"],
};

// Task definitions are immutable revisions; any change registers a new one.
static TASK_DEFINITION: Schema = Schema {
    inputs: &[
        field("family", FieldType::String).required().force_new(),
        field("cpu", FieldType::String).force_new(),
        field("memory", FieldType::String).force_new(),
        field("network_mode", FieldType::String).force_new(),
        field("requires_compatibilities", StringList).force_new(),
        field("execution_role_arn", FieldType::String).force_new(),
        field("container_definitions", FieldType::String)
            .required()
            .force_new(),
    ],
    outputs: &["id", "arn", "revision"],
};

static SERVICE: Schema = Schema {
    inputs: &[
        field("name", FieldType::String).force_new(),
        field("cluster", FieldType::String).required().force_new(),
        field("task_definition", FieldType::String).required(),
        field("desired_count", Integer),
        field("launch_type", FieldType::String).force_new(),
        field("assign_public_ip", Bool),
        field("subnets", StringList),
        field("security_groups", StringList),
    ],
    outputs: &["id", "arn", "name"],
};

impl ResourceKind {
    pub const ALL: [Self; 13] = [
        Self::Vpc,
        Self::SecurityGroup,
        Self::TargetGroup,
        Self::LoadBalancer,
        Self::Listener,
        Self::Repository,
        Self::Image,
        Self::LogGroup,
        Self::Cluster,
        Self::Role,
        Self::RolePolicyAttachment,
        Self::TaskDefinition,
        Self::Service,
    ];

    pub fn schema(&self) -> &'static Schema {
        match self {
            Self::Vpc => &VPC,
            Self::SecurityGroup => &SECURITY_GROUP,
            Self::TargetGroup => &TARGET_GROUP,
            Self::LoadBalancer => &LOAD_BALANCER,
            Self::Listener => &LISTENER,
            Self::Repository => &REPOSITORY,
            Self::Image => &IMAGE,
            Self::LogGroup => &LOG_GROUP,
            Self::Cluster => &CLUSTER,
            Self::Role => &ROLE,
            Self::RolePolicyAttachment => &ROLE_POLICY_ATTACHMENT,
            Self::TaskDefinition => &TASK_DEFINITION,
            Self::Service => &SERVICE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vpc => "vpc",
            Self::SecurityGroup => "security_group",
            Self::TargetGroup => "target_group",
            Self::LoadBalancer => "load_balancer",
            Self::Listener => "listener",
            Self::Repository => "repository",
            Self::Image => "image",
            Self::LogGroup => "log_group",
            Self::Cluster => "cluster",
            Self::Role => "role",
            Self::RolePolicyAttachment => "role_policy_attachment",
            Self::TaskDefinition => "task_definition",
            Self::Service => "service",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown resource kind: {s}"))
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Check one value against its field spec.
pub fn validate_value(
    resource: &str,
    kind: ResourceKind,
    field: &str,
    value: &Value,
) -> Result<(), DeclarationError> {
    let spec = kind
        .schema()
        .input(field)
        .ok_or_else(|| DeclarationError::InvalidInput {
            resource: resource.to_string(),
            field: field.to_string(),
            reason: format!("{kind} has no such input"),
        })?;

    if !spec.ty.accepts(value) {
        return Err(DeclarationError::InvalidInput {
            resource: resource.to_string(),
            field: field.to_string(),
            reason: format!("expected {}", spec.ty.name()),
        });
    }
    Ok(())
}

/// Check that every required field of `kind` is present and no unknown
/// field is given.
pub fn validate_fields<'a>(
    resource: &str,
    kind: ResourceKind,
    fields: impl IntoIterator<Item = &'a str>,
) -> Result<(), DeclarationError> {
    let schema = kind.schema();
    let given: BTreeSet<&str> = fields.into_iter().collect();

    if let Some(unknown) = given.iter().find(|name| schema.input(name).is_none()) {
        return Err(DeclarationError::InvalidInput {
            resource: resource.to_string(),
            field: (*unknown).to_string(),
            reason: format!("{kind} has no such input"),
        });
    }

    if let Some(missing) = schema
        .inputs
        .iter()
        .find(|f| f.required && !given.contains(f.name))
    {
        return Err(DeclarationError::InvalidInput {
            resource: resource.to_string(),
            field: missing.name.to_string(),
            reason: "required field is missing".to_string(),
        });
    }
    Ok(())
}

/// Replace secret values with a digest so they can be recorded and compared.
pub fn seal(
    inputs: &BTreeMap<String, Value>,
    secret_fields: &BTreeSet<String>,
) -> BTreeMap<String, Value> {
    inputs
        .iter()
        .map(|(name, value)| {
            let value = if secret_fields.contains(name) {
                digest(value)
            } else {
                value.clone()
            };
            (name.clone(), value)
        })
        .collect()
}

/// Replace secret values with a fixed marker for display and logs.
pub fn redact(
    inputs: &BTreeMap<String, Value>,
    secret_fields: &BTreeSet<String>,
) -> BTreeMap<String, Value> {
    inputs
        .iter()
        .map(|(name, value)| {
            let value = if secret_fields.contains(name) {
                Value::String("[secret]".to_string())
            } else {
                value.clone()
            };
            (name.clone(), value)
        })
        .collect()
}

pub fn digest(value: &Value) -> Value {
    let hash = blake3::hash(value.to_string().as_bytes());
    Value::String(format!("blake3:{}", hash.to_hex()))
}
