//! Launch plan for dry-run mode

use crate::config::{DependencyCondition, RestartPolicy};
use crate::runtime::graph::ServiceGraph;
use indexmap::IndexMap;
use std::path::PathBuf;

/// Resolved launch plan
#[derive(Debug)]
pub struct LaunchPlan {
    /// Project name, if the compose file declares one
    pub project: Option<String>,
    /// Services grouped into concurrently launchable stages
    pub stages: Vec<Vec<String>>,
    /// Services in launch order
    pub services: Vec<LaunchPlanService>,
}

/// A service in the launch plan
#[derive(Debug)]
pub struct LaunchPlanService {
    pub name: String,
    pub command: Vec<String>,
    pub env: IndexMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub dependencies: Vec<(String, DependencyCondition)>,
    pub restart: RestartPolicy,
    pub max_restarts: Option<u32>,
    /// Human readable probe policy
    pub probe: Option<String>,
    pub networks: Vec<String>,
    pub ports: Vec<String>,
    pub volumes: Vec<String>,
}

impl LaunchPlan {
    pub fn new(graph: &ServiceGraph, project: Option<String>) -> Self {
        let stages = graph
            .stages()
            .into_iter()
            .map(|stage| stage.into_iter().map(str::to_string).collect())
            .collect();

        let services = graph
            .launch_order()
            .map(|spec| LaunchPlanService {
                name: spec.name.clone(),
                command: spec.command.clone(),
                env: spec.env.clone(),
                working_dir: spec.working_dir.clone(),
                dependencies: spec
                    .dependencies
                    .iter()
                    .map(|e| (e.dependency.clone(), e.condition))
                    .collect(),
                restart: spec.restart,
                max_restarts: spec.max_restarts,
                probe: spec.probe.as_ref().map(|p| {
                    format!(
                        "{} (interval {:?}, timeout {:?}, retries {}, start period {:?})",
                        p.command, p.interval, p.timeout, p.retries, p.start_period
                    )
                }),
                networks: spec.networks.clone(),
                ports: spec.ports.clone(),
                volumes: spec.volumes.clone(),
            })
            .collect();

        Self {
            project,
            stages,
            services,
        }
    }
}

/// Display the launch plan in a human-readable format
impl std::fmt::Display for LaunchPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Launch Plan")?;
        writeln!(f, "===========")?;
        writeln!(f)?;

        if let Some(project) = &self.project {
            writeln!(f, "Project: {}", project)?;
            writeln!(f)?;
        }

        writeln!(f, "Stages:")?;
        for (i, stage) in self.stages.iter().enumerate() {
            writeln!(f, "  {}: {}", i + 1, stage.join(", "))?;
        }
        writeln!(f)?;

        writeln!(f, "Services (in launch order):")?;
        for (i, service) in self.services.iter().enumerate() {
            writeln!(f)?;
            writeln!(f, "  {}. {}", i + 1, service.name)?;
            writeln!(f, "     Command: {}", service.command.join(" "))?;

            if let Some(dir) = &service.working_dir {
                writeln!(f, "     Working dir: {}", dir.display())?;
            }

            if !service.dependencies.is_empty() {
                let deps: Vec<String> = service
                    .dependencies
                    .iter()
                    .map(|(name, condition)| format!("{} ({})", name, condition))
                    .collect();
                writeln!(f, "     Depends on: {}", deps.join(", "))?;
            }

            match service.max_restarts {
                Some(max) => writeln!(f, "     Restart: {} (max {})", service.restart, max)?,
                None => writeln!(f, "     Restart: {}", service.restart)?,
            }

            if let Some(probe) = &service.probe {
                writeln!(f, "     Healthcheck: {}", probe)?;
            }

            if !service.networks.is_empty() {
                writeln!(f, "     Networks: {}", service.networks.join(", "))?;
            }
            if !service.ports.is_empty() {
                writeln!(f, "     Ports: {}", service.ports.join(", "))?;
            }
            if !service.volumes.is_empty() {
                writeln!(f, "     Volumes: {}", service.volumes.join(", "))?;
            }

            if !service.env.is_empty() {
                writeln!(f, "     Environment:")?;
                for (key, value) in &service.env {
                    writeln!(f, "       {}={}", key, value)?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ComposeFile, Interpolator};
    use std::path::Path;

    #[test]
    fn test_plan_display() {
        let yaml = r#"
name: shop
services:
  db:
    command: ["postgres"]
    environment:
      POSTGRES_DB: app
    healthcheck:
      test: ["CMD-SHELL", "pg_isready"]
      interval: 10s
  web:
    command: python manage.py runserver
    depends_on:
      db:
        condition: service_healthy
    restart: on-failure
    ports: ["8000:8000"]
"#;
        let compose = ComposeFile::from_yaml_with(yaml, &Interpolator::isolated()).unwrap();
        let graph = ServiceGraph::build(&compose, Path::new("/srv/shop"), &[]).unwrap();
        let plan = LaunchPlan::new(&graph, compose.name.clone());

        assert_eq!(plan.stages, vec![vec!["db"], vec!["web"]]);
        assert_eq!(
            plan.services[1].dependencies,
            vec![("db".to_string(), DependencyCondition::ServiceHealthy)]
        );

        let text = plan.to_string();
        assert!(text.contains("Project: shop"));
        assert!(text.contains("1. db"));
        assert!(text.contains("2. web"));
        assert!(text.contains("Depends on: db (service_healthy)"));
        assert!(text.contains("Restart: on-failure"));
        assert!(text.contains("Ports: 8000:8000"));
        assert!(text.contains("POSTGRES_DB=app"));
    }
}
