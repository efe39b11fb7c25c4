//! Minimal reader for workflow documents.
//!
//! Only the keys the engine needs are interpreted: `name`, `on` and, per job,
//! `name`, `runs-on` and `needs`. Each job is re-serialized into a
//! single-job document that is handed to the runner untouched otherwise.

use anyhow::{Result, bail};
use serde_yaml::{Mapping, Value};

/// A workflow file as found at the event's commit.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct WorkflowFile {
    /// File name, used as the workflow id (e.g. `ci.yml`).
    pub id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    pub name: Option<String>,
    pub triggers: Vec<TriggerDecl>,
    pub jobs: Vec<WorkflowJob>,
}

/// One entry of the `on:` declaration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TriggerDecl {
    pub event: String,
    pub branches: Vec<String>,
    pub branches_ignore: Vec<String>,
    pub tags: Vec<String>,
    pub tags_ignore: Vec<String>,
    pub paths: Vec<String>,
    pub paths_ignore: Vec<String>,
    pub types: Vec<String>,
    pub inputs: Vec<DispatchInput>,
}

/// A `workflow_dispatch` input declaration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DispatchInput {
    pub key: String,
    pub description: Option<String>,
    pub required: bool,
    pub default: Option<String>,
    pub input_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowJob {
    pub key: String,
    pub name: String,
    pub runs_on: Vec<String>,
    pub needs: Vec<String>,
    /// Single-job workflow document for this job.
    pub payload: String,
}

impl Workflow {
    pub fn trigger(&self, event: &str) -> Option<&TriggerDecl> {
        self.triggers.iter().find(|t| t.event == event)
    }
}

/// Parse a workflow document.
pub fn parse_workflow(content: &str) -> Result<Workflow> {
    let doc: Value = serde_yaml::from_str(content)?;
    let Some(root) = doc.as_mapping() else {
        bail!("workflow must be a mapping");
    };

    let name = root.get("name").and_then(scalar_string);

    let on = root
        .get("on")
        .ok_or_else(|| anyhow::anyhow!("missing 'on' key"))?;
    let triggers = parse_triggers(on)?;
    if triggers.is_empty() {
        bail!("'on' declares no events");
    }

    let jobs_value = root
        .get("jobs")
        .and_then(Value::as_mapping)
        .ok_or_else(|| anyhow::anyhow!("missing or invalid 'jobs' mapping"))?;
    if jobs_value.is_empty() {
        bail!("'jobs' is empty");
    }

    let mut jobs = Vec::with_capacity(jobs_value.len());
    for (key, body) in jobs_value {
        let Some(key) = key.as_str() else {
            bail!("job keys must be strings");
        };
        let Some(body_map) = body.as_mapping() else {
            bail!("job '{}' must be a mapping", key);
        };
        let job_name = body_map
            .get("name")
            .and_then(scalar_string)
            .unwrap_or_else(|| key.to_string());
        let runs_on = string_list(body_map.get("runs-on"))
            .map_err(|e| anyhow::anyhow!("job '{}': runs-on {}", key, e))?;
        let needs = string_list(body_map.get("needs"))
            .map_err(|e| anyhow::anyhow!("job '{}': needs {}", key, e))?;

        let mut single_jobs = Mapping::new();
        single_jobs.insert(Value::from(key), body.clone());
        let mut single = Mapping::new();
        if let Some(n) = root.get("name") {
            single.insert(Value::from("name"), n.clone());
        }
        single.insert(Value::from("on"), on.clone());
        single.insert(Value::from("jobs"), Value::Mapping(single_jobs));
        let payload = serde_yaml::to_string(&Value::Mapping(single))?;

        jobs.push(WorkflowJob {
            key: key.to_string(),
            name: job_name,
            runs_on,
            needs,
            payload,
        });
    }

    for job in &jobs {
        for need in &job.needs {
            if need == &job.key {
                bail!("job '{}' needs itself", job.key);
            }
            if !jobs.iter().any(|j| &j.key == need) {
                bail!("job '{}' needs unknown job '{}'", job.key, need);
            }
        }
    }

    if let Some(stuck) = find_cycle(&jobs) {
        bail!("jobs {} have circular needs", stuck.join(", "));
    }

    Ok(Workflow {
        name,
        triggers,
        jobs,
    })
}

/// Kahn's algorithm over `needs`; returns the keys left once no job can be
/// released, in declaration order.
fn find_cycle(jobs: &[WorkflowJob]) -> Option<Vec<String>> {
    let mut pending: Vec<usize> = jobs.iter().map(|j| j.needs.len()).collect();
    let mut ready: Vec<usize> = (0..jobs.len()).filter(|&i| pending[i] == 0).collect();
    let mut released = 0;

    while let Some(done) = ready.pop() {
        released += 1;
        let key = &jobs[done].key;
        for (i, job) in jobs.iter().enumerate() {
            let hits = job.needs.iter().filter(|n| *n == key).count();
            if hits > 0 && pending[i] > 0 {
                pending[i] -= hits;
                if pending[i] == 0 {
                    ready.push(i);
                }
            }
        }
    }

    if released == jobs.len() {
        return None;
    }
    Some(
        jobs.iter()
            .zip(&pending)
            .filter(|(_, p)| **p > 0)
            .map(|(j, _)| j.key.clone())
            .collect(),
    )
}

fn parse_triggers(on: &Value) -> Result<Vec<TriggerDecl>> {
    match on {
        Value::String(event) => Ok(vec![TriggerDecl {
            event: event.clone(),
            ..Default::default()
        }]),
        Value::Sequence(events) => events
            .iter()
            .map(|e| match e.as_str() {
                Some(event) => Ok(TriggerDecl {
                    event: event.to_string(),
                    ..Default::default()
                }),
                None => bail!("'on' list entries must be strings"),
            })
            .collect(),
        Value::Mapping(map) => {
            let mut triggers = Vec::with_capacity(map.len());
            for (event, filters) in map {
                let Some(event) = event.as_str() else {
                    bail!("'on' keys must be strings");
                };
                triggers.push(parse_trigger(event, filters)?);
            }
            Ok(triggers)
        }
        _ => bail!("'on' must be a string, a list or a mapping"),
    }
}

fn parse_trigger(event: &str, filters: &Value) -> Result<TriggerDecl> {
    let mut decl = TriggerDecl {
        event: event.to_string(),
        ..Default::default()
    };
    let map = match filters {
        Value::Null => return Ok(decl),
        Value::Mapping(map) => map,
        _ => bail!("filters of '{}' must be a mapping", event),
    };

    let list = |key: &str| {
        string_list(map.get(key)).map_err(|e| anyhow::anyhow!("{}.{} {}", event, key, e))
    };
    decl.branches = list("branches")?;
    decl.branches_ignore = list("branches-ignore")?;
    decl.tags = list("tags")?;
    decl.tags_ignore = list("tags-ignore")?;
    decl.paths = list("paths")?;
    decl.paths_ignore = list("paths-ignore")?;
    decl.types = list("types")?;

    if let Some(inputs) = map.get("inputs") {
        let Some(inputs) = inputs.as_mapping() else {
            bail!("{}.inputs must be a mapping", event);
        };
        for (key, def) in inputs {
            let Some(key) = key.as_str() else {
                bail!("input names must be strings");
            };
            let def = def.as_mapping();
            let get = |field: &str| def.and_then(|s| s.get(field));
            decl.inputs.push(DispatchInput {
                key: key.to_string(),
                description: get("description").and_then(scalar_string),
                required: get("required").and_then(Value::as_bool).unwrap_or(false),
                default: get("default").and_then(scalar_string),
                input_type: get("type").and_then(scalar_string),
            });
        }
    }

    Ok(decl)
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_list(v: Option<&Value>) -> std::result::Result<Vec<String>, String> {
    match v {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Sequence(items)) => items
            .iter()
            .map(|i| scalar_string(i).ok_or_else(|| "must contain only strings".to_string()))
            .collect(),
        Some(other) => scalar_string(other)
            .map(|s| vec![s])
            .ok_or_else(|| "must be a string or a list".to_string()),
    }
}
