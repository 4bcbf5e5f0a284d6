//! Task introspection shared by both schedulers.
//!
//! Instances are always recomputed from the orchestrator: tasks are found
//! through the app's services and through the app's one-off runs, described
//! in bounded batches, and mapped back to processes via their task
//! definitions.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use futures_util::future::try_join_all;
use tracing::{debug, instrument};

use crate::backend::orchestrator::{
    name_from_arn, ListTasksInput, RunTaskInput, Task, TaskDefinitionInput, MAX_DESCRIBE_TASKS,
    TASK_PENDING, TASK_RUNNING, TASK_STOPPED,
};
use crate::backend::{BackendResult, Orchestrator};
use crate::cache::TaskDefinitionCache;
use crate::error::SchedulerResult;
use crate::task;
use crate::types::{App, Instance, Process};

/// A live service and the process type it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRef {
    pub name: String,
    pub process_type: String,
}

/// List every instance of an app.
///
/// `services` are the app's services; `started_by` tags one-off runs.
#[instrument(skip(orchestrator, cache, services), fields(services = services.len()))]
pub async fn list_instances(
    orchestrator: &dyn Orchestrator,
    cache: &TaskDefinitionCache,
    cluster: &str,
    services: &[ServiceRef],
    started_by: &str,
) -> SchedulerResult<Vec<Instance>> {
    let by_service = services.iter().map(|service| async move {
        let arns = list_all_tasks(
            orchestrator,
            ListTasksInput {
                cluster: cluster.to_string(),
                service_name: Some(service.name.clone()),
                ..Default::default()
            },
        )
        .await?;
        Ok::<_, crate::backend::BackendError>((Some(service.process_type.clone()), arns))
    });
    let one_off = async {
        let arns = list_all_tasks(
            orchestrator,
            ListTasksInput {
                cluster: cluster.to_string(),
                started_by: Some(started_by.to_string()),
                ..Default::default()
            },
        )
        .await?;
        Ok::<_, crate::backend::BackendError>((None, arns))
    };

    let (mut listed, runs) = futures_util::try_join!(try_join_all(by_service), one_off)?;
    listed.push(runs);

    // Service membership wins over started-by when a task shows up in both.
    let mut task_types: BTreeMap<String, Option<String>> = BTreeMap::new();
    for (process_type, arns) in listed {
        for arn in arns {
            let entry = task_types.entry(arn).or_insert(None);
            if entry.is_none() {
                *entry = process_type.clone();
            }
        }
    }

    let arns: Vec<String> = task_types.keys().cloned().collect();
    let tasks = describe_tasks(orchestrator, cluster, &arns).await?;
    debug!(tasks = tasks.len(), "Described tasks");

    let definition_arns: BTreeSet<&str> = tasks
        .iter()
        .map(|t| t.task_definition_arn.as_str())
        .collect();
    let definitions: BTreeMap<&str, _> = try_join_all(definition_arns.into_iter().map(|arn| async move {
        cache
            .get(orchestrator, arn)
            .await
            .map(|definition| (arn, definition))
    }))
    .await?
    .into_iter()
    .collect();

    let mut instances = Vec::with_capacity(tasks.len());
    for task in &tasks {
        let Some(definition) = definitions.get(task.task_definition_arn.as_str()) else {
            continue;
        };
        let Some(mut process) = task::process_from_task_definition(definition) else {
            continue;
        };
        if let Some(Some(process_type)) = task_types.get(&task.arn) {
            process.process_type = process_type.clone();
        }

        instances.push(Instance {
            process,
            id: name_from_arn(&task.arn).to_string(),
            updated_at: instance_timestamp(task),
            state: task.last_status.clone(),
        });
    }

    instances.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(instances)
}

/// Describe tasks in batches no larger than the backend accepts.
///
/// Batches are issued concurrently; any failure fails the whole call.
pub async fn describe_tasks(
    orchestrator: &dyn Orchestrator,
    cluster: &str,
    arns: &[String],
) -> BackendResult<Vec<Task>> {
    let batches = arns
        .chunks(MAX_DESCRIBE_TASKS)
        .map(|chunk| orchestrator.describe_tasks(cluster, chunk));

    Ok(try_join_all(batches).await?.into_iter().flatten().collect())
}

async fn list_all_tasks(
    orchestrator: &dyn Orchestrator,
    mut input: ListTasksInput,
) -> BackendResult<Vec<String>> {
    let mut arns = Vec::new();
    loop {
        let page = orchestrator.list_tasks(input.clone()).await?;
        arns.extend(page.items);
        match page.next_token {
            Some(token) => input.next_token = Some(token),
            None => return Ok(arns),
        }
    }
}

/// The timestamp that matters for a task in its current state.
pub fn instance_timestamp(task: &Task) -> DateTime<Utc> {
    let preferred = match task.last_status.as_str() {
        TASK_PENDING => task.created_at,
        TASK_RUNNING => task.started_at,
        TASK_STOPPED => task.stopped_at,
        _ => None,
    };

    preferred
        .or(task.started_at)
        .or(task.created_at)
        .unwrap_or_default()
}

/// Start a detached one-off task for a process.
///
/// The task is tagged with the app id so [`list_instances`] finds it.
#[instrument(skip(orchestrator, cache, app, process), fields(app_id = %app.id, process_type = %process.process_type))]
pub async fn run_detached(
    orchestrator: &dyn Orchestrator,
    cache: &TaskDefinitionCache,
    cluster: &str,
    app: &App,
    process: &Process,
) -> SchedulerResult<()> {
    let definition = orchestrator
        .register_task_definition(TaskDefinitionInput {
            family: task::run_family(&app.id, &process.process_type),
            containers: vec![task::container_definition(process, None)],
        })
        .await?;
    let definition = cache.insert(definition).await;

    let tasks = orchestrator
        .run_task(RunTaskInput {
            cluster: cluster.to_string(),
            task_definition: definition.arn.clone(),
            count: 1,
            started_by: Some(app.id.clone()),
        })
        .await?;

    debug!(tasks = tasks.len(), "Started one-off task");
    Ok(())
}
