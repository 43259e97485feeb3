//! End-to-end routing: YAML policy in, destination decisions out.

use gantry_routing::loader::parse_policy;
use gantry_routing::{JobFeatures, RouteRequest, RouteSource, RoutingError, RoutingPolicy, RuleType};
use serde_json::json;

const MB: u64 = 1024 * 1024;

const POLICY: &str = r#"
verbose: true
default_destination:
  priority:
    low: cluster_low
    med: cluster_default
    high: cluster_high
default_priority: med
users:
  vip@example.org:
    priority: high
tools:
  bwa:
    default_destination: cluster_default
    rules:
      - rule_type: file_size
        nice_value: 0
        lower_bound: 0
        upper_bound: 1 GB
        destination: local
      - rule_type: file_size
        nice_value: 5
        lower_bound: 0
        upper_bound: Infinity
        destination: slurm_long
      - rule_type: file_size
        nice_value: -5
        lower_bound: 400 MB
        upper_bound: 600 MB
        destination: cluster_high
        users:
          - vip@example.org
  blast:
    rules:
      - rule_type: arguments
        nice_value: 0
        arguments:
          db: nr
        destination: fail
        fail_message: Searching nr is not allowed here.
      - rule_type: records
        nice_value: 0
        lower_bound: 1000000
        upper_bound: Infinity
        destination:
          priority:
            low: slurm_long
            high: cluster_high
  sort1: {}
"#;

fn policy() -> RoutingPolicy {
    let known: Vec<String> = [
        "cluster_low",
        "cluster_default",
        "cluster_high",
        "local",
        "slurm_long",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let (policy, report) = parse_policy(POLICY, &known).expect("policy parses");
    assert!(report.valid, "{:?}", report.errors);
    policy
}

fn sized(bytes: u64) -> JobFeatures {
    JobFeatures {
        file_size: Some(bytes),
        num_input_datasets: Some(1),
        ..Default::default()
    }
}

#[test]
fn file_size_rule_overrides_tool_default() {
    let policy = policy();
    let req = RouteRequest {
        tool_id: "bwa",
        user_email: Some("ada@example.org"),
        features: sized(500 * MB),
        ..Default::default()
    };
    let decision = policy.resolve(&req).unwrap();
    assert_eq!(decision.destination_id, "local");
    assert_eq!(decision.source, RouteSource::Rule(0));
}

#[test]
fn lowest_nice_value_wins() {
    let policy = policy();
    let req = RouteRequest {
        tool_id: "bwa",
        user_email: Some("vip@example.org"),
        features: sized(500 * MB),
        ..Default::default()
    };
    assert_eq!(policy.resolve(&req).unwrap().destination_id, "cluster_high");

    // Outside the -5 rule's window, the 0 rule beats the 5 rule.
    let req = RouteRequest {
        features: sized(700 * MB),
        ..req
    };
    assert_eq!(policy.resolve(&req).unwrap().destination_id, "local");

    // Only the open-ended rule matches.
    let req = RouteRequest {
        features: sized(2048 * MB),
        ..req
    };
    assert_eq!(policy.resolve(&req).unwrap().destination_id, "slurm_long");
}

#[test]
fn upper_bound_is_exclusive() {
    let policy = policy();
    let req = RouteRequest {
        tool_id: "bwa",
        features: sized(1024 * MB),
        ..Default::default()
    };
    assert_eq!(policy.resolve(&req).unwrap().destination_id, "slurm_long");
}

#[test]
fn fail_rule_rejects_with_message() {
    let policy = policy();
    let req = RouteRequest {
        tool_id: "blast",
        features: JobFeatures {
            params: json!({"db": "nr", "evalue": 0.001}),
            ..Default::default()
        },
        ..Default::default()
    };
    assert_eq!(
        policy.resolve(&req),
        Err(RoutingError::Rejected {
            message: "Searching nr is not allowed here.".to_string()
        })
    );
}

#[test]
fn priority_precedence() {
    let policy = policy();
    let features = JobFeatures {
        records: Some(5_000_000),
        params: json!({"db": "pdb"}),
        ..Default::default()
    };

    // User priority: high.
    let req = RouteRequest {
        tool_id: "blast",
        user_email: Some("vip@example.org"),
        features: features.clone(),
        ..Default::default()
    };
    assert_eq!(policy.resolve(&req).unwrap().destination_id, "cluster_high");

    // Resource parameter beats the user's priority.
    let req = RouteRequest {
        resource_priority: Some("low"),
        ..req
    };
    assert_eq!(policy.resolve(&req).unwrap().destination_id, "slurm_long");

    // Workflow priority beats both.
    let req = RouteRequest {
        workflow_priority: Some("high"),
        ..req
    };
    let decision = policy.resolve(&req).unwrap();
    assert_eq!(decision.destination_id, "cluster_high");
    assert_eq!(decision.priority.as_deref(), Some("high"));
}

#[test]
fn priority_map_without_entry_uses_default_priority_or_errors() {
    let policy = policy();
    // Default priority is med, and the records rule has no med entry.
    let req = RouteRequest {
        tool_id: "blast",
        features: JobFeatures {
            records: Some(5_000_000),
            ..Default::default()
        },
        ..Default::default()
    };
    assert!(matches!(
        policy.resolve(&req),
        Err(RoutingError::Configuration(_))
    ));
}

#[test]
fn fallbacks_to_tool_then_global_default() {
    let policy = policy();

    let req = RouteRequest {
        tool_id: "bwa",
        features: JobFeatures::default(),
        ..Default::default()
    };
    let decision = policy.resolve(&req).unwrap();
    assert_eq!(decision.destination_id, "cluster_default");
    assert_eq!(decision.source, RouteSource::ToolDefault);

    let req = RouteRequest {
        tool_id: "unlisted",
        user_email: Some("vip@example.org"),
        ..Default::default()
    };
    let decision = policy.resolve(&req).unwrap();
    assert_eq!(decision.destination_id, "cluster_high");
    assert_eq!(decision.source, RouteSource::GlobalDefault);
}

#[test]
fn no_default_anywhere_is_a_configuration_error() {
    let (policy, _) = parse_policy("tools:\n  bwa: {}\n", &[]).unwrap();
    let req = RouteRequest {
        tool_id: "bwa",
        ..Default::default()
    };
    assert!(matches!(
        policy.resolve(&req),
        Err(RoutingError::Configuration(_))
    ));
}

#[test]
fn required_features_lists_rule_types() {
    let policy = policy();
    let needed = policy.required_features("blast");
    assert!(needed.contains(&RuleType::Arguments));
    assert!(needed.contains(&RuleType::Records));
    assert!(!needed.contains(&RuleType::FileSize));
    assert!(policy.required_features("sort1").is_empty());
}
