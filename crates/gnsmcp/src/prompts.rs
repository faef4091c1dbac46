//! Guided workflow prompts.
//!
//! Prompts are canned multi-step instructions the assistant can offer the
//! operator; they reference the tool catalog but perform no actions
//! themselves.

use gns_proto::{ErrorCode, ErrorEnvelope};
use serde_json::{Map, Value, json};

struct PromptSpec {
    name: &'static str,
    description: &'static str,
    arguments: &'static [(&'static str, &'static str, bool)],
}

const PROMPTS: &[PromptSpec] = &[
    PromptSpec {
        name: "configure_device_ssh",
        description: "Enable SSH on a lab device via its console, then hand the session to the SSH proxy",
        arguments: &[
            ("node_name", "Node to configure", true),
            ("mgmt_ip", "Management IP address to assign", false),
        ],
    },
    PromptSpec {
        name: "troubleshoot_connectivity",
        description: "Step-by-step reachability triage between two nodes",
        arguments: &[
            ("source", "Source node name", true),
            ("destination", "Destination node name or address", true),
        ],
    },
    PromptSpec {
        name: "build_lab_topology",
        description: "Create a project, place nodes from templates, and wire them",
        arguments: &[("description", "What the lab should look like", true)],
    },
];

pub fn list() -> Vec<Value> {
    PROMPTS
        .iter()
        .map(|p| {
            json!({
                "name": p.name,
                "description": p.description,
                "arguments": p.arguments.iter().map(|(name, description, required)| {
                    json!({ "name": name, "description": description, "required": required })
                }).collect::<Vec<_>>(),
            })
        })
        .collect()
}

fn arg<'a>(args: &'a Map<String, Value>, key: &str) -> &'a str {
    args.get(key).and_then(Value::as_str).unwrap_or("<unset>")
}

pub fn get(name: &str, args: &Map<String, Value>) -> Result<Value, ErrorEnvelope> {
    let text = match name {
        "configure_device_ssh" => {
            let node = arg(args, "node_name");
            let mgmt_ip = arg(args, "mgmt_ip");
            format!(
                "Enable SSH access on '{node}':\n\
                 1. console(action=send_and_wait, node_name={node}, data=\"\\n\", wait_pattern=\"[>#]\") to reach the CLI.\n\
                 2. Through the console, configure a management address ({mgmt_ip}), a local user, and the SSH server.\n\
                 3. Verify the device answers on port 22 from the simulator host.\n\
                 4. ssh(action=configure, node_name={node}, host=..., username=..., password=...) to hand the session to the proxy.\n\
                 5. ssh(action=send_command, node_name={node}, command=\"show version\") to confirm."
            )
        }
        "troubleshoot_connectivity" => {
            let source = arg(args, "source");
            let destination = arg(args, "destination");
            format!(
                "Triage reachability from '{source}' to '{destination}':\n\
                 1. node(action=status, name={source}) — confirm the node is started.\n\
                 2. query_resource(uri=gns3://projects) and the project's links — confirm a path exists.\n\
                 3. console(action=send_and_wait, node_name={source}, data=\"ping {destination}\\n\", wait_pattern=\"[>#]\", timeout=30).\n\
                 4. If the ping fails, inspect interfaces and routes on each hop with ssh(action=send_command).\n\
                 5. Report which hop breaks and why."
            )
        }
        "build_lab_topology" => {
            let description = arg(args, "description");
            format!(
                "Build this lab: {description}\n\
                 1. project(action=create, name=...) then project(action=open, name=...).\n\
                 2. node(action=create, template=..., x=..., y=...) for each device; space positions on the canvas.\n\
                 3. set_connection(operations=[{{action: connect, a: ..., b: ...}}]) — batch all links in one call; the batch is validated before anything is applied.\n\
                 4. node(action=start_all), then confirm with node(action=list)."
            )
        }
        other => {
            return Err(ErrorEnvelope::new(
                ErrorCode::InvalidParameter,
                format!("unknown prompt '{other}'"),
            )
            .with_context(
                "available_prompts",
                json!(PROMPTS.iter().map(|p| p.name).collect::<Vec<_>>()),
            ));
        }
    };

    let description = PROMPTS
        .iter()
        .find(|p| p.name == name)
        .map(|p| p.description)
        .unwrap_or_default();

    Ok(json!({
        "description": description,
        "messages": [{
            "role": "user",
            "content": { "type": "text", "text": text },
        }],
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_covers_all_prompts() {
        let listed = list();
        assert_eq!(listed.len(), 3);
        assert!(listed.iter().all(|p| p["name"].is_string()));
    }

    #[test]
    fn test_get_substitutes_arguments() {
        let mut args = Map::new();
        args.insert("node_name".to_string(), json!("R1"));
        let prompt = get("configure_device_ssh", &args).expect("prompt");
        let text = prompt["messages"][0]["content"]["text"].as_str().expect("text");
        assert!(text.contains("'R1'"));
        assert!(text.contains("ssh(action=configure"));
    }

    #[test]
    fn test_get_unknown_prompt_lists_alternatives() {
        let err = get("nonexistent", &Map::new()).expect_err("unknown");
        let v = err.to_value();
        assert_eq!(v["context"]["available_prompts"][0], "configure_device_ssh");
    }
}
