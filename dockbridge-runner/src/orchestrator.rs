use crate::process::CommandExecutor;
use dockbridge_core::{CommandSpec, DeployConfig, DeployReport, DeployStatus, ExecutionOutcome};
use std::path::Path;
use tracing::{error, info, warn};

const VERSION_CHECK_SECS: i64 = 10;
const TAG_SECS: i64 = 60;
const PUSH_SECS: i64 = 600;
const COMPOSE_DOWN_SECS: i64 = 180;
const COMPOSE_PS_SECS: i64 = 30;
const COMPOSE_LOGS_SECS: i64 = 60;
const CLEANUP_STEP_SECS: i64 = 60;
const REMOVE_IMAGES_SECS: i64 = 120;

/// Builds docker and compose command lines and interprets their outcomes
pub struct DockerOrchestrator<E: CommandExecutor> {
    executor: E,
    config: DeployConfig,
    compose_program: String,
}

impl<E: CommandExecutor> DockerOrchestrator<E> {
    pub fn new(executor: E, config: DeployConfig) -> Self {
        let compose_program = config.compose_path.clone();
        Self {
            executor,
            config,
            compose_program,
        }
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// Program used for compose commands, after `check_environment` picked one.
    pub fn compose_program(&self) -> &str {
        &self.compose_program
    }

    async fn run(&self, command: String, timeout_secs: i64) -> ExecutionOutcome {
        let spec = CommandSpec::new(command).with_timeout_secs(timeout_secs);
        self.executor.execute(&spec).await
    }

    fn docker(&self) -> String {
        shell_quote(&self.config.docker_path)
    }

    fn compose(&self, file: &str) -> String {
        // May be a two-word invocation like `docker compose`, so it is not quoted.
        format!("{} -f {}", self.compose_program, shell_quote(file))
    }

    /// Verify the docker CLI exists and pick a compose program.
    ///
    /// The standalone compose binary is tried first, then the `docker compose` plugin.
    pub async fn check_environment(&mut self) -> DeployReport {
        info!(docker = %self.config.docker_path, "Checking docker environment");

        if let Err(e) = which::which(&self.config.docker_path) {
            error!(docker = %self.config.docker_path, error = %e, "Docker CLI not found on PATH");
            return DeployReport::new("check", DeployStatus::DockerNotFound);
        }

        let mut report = DeployReport::new("check", DeployStatus::Success);

        let docker = self
            .run(format!("{} --version", self.docker()), VERSION_CHECK_SECS)
            .await;
        let docker_ok = docker.success();
        report.outcomes.push(docker);
        if !docker_ok {
            error!("Docker CLI did not report a version");
            report.status = DeployStatus::DockerNotFound;
            return report;
        }

        let standalone = self
            .run(
                format!("{} --version", self.config.compose_path),
                VERSION_CHECK_SECS,
            )
            .await;
        let standalone_ok = standalone.success();
        report.outcomes.push(standalone);
        if standalone_ok {
            self.compose_program = self.config.compose_path.clone();
            return report;
        }

        warn!(compose = %self.config.compose_path, "Standalone compose not found, trying docker compose plugin");
        let plugin = self
            .run(format!("{} compose version", self.docker()), VERSION_CHECK_SECS)
            .await;
        let plugin_ok = plugin.success();
        report.outcomes.push(plugin);
        if plugin_ok {
            self.compose_program = format!("{} compose", self.docker());
        } else {
            warn!("Docker compose is not available");
            report.status = DeployStatus::ComposeNotFound;
        }
        report
    }

    /// `docker build` with the configured build args and platform
    pub async fn build_image(&self, dockerfile: &str, tag: &str, context: &str) -> DeployReport {
        if !Path::new(dockerfile).exists() {
            error!(dockerfile = %dockerfile, "Dockerfile not found");
            return DeployReport::new("build", DeployStatus::FileNotFound);
        }

        let mut command = format!(
            "{} build -f {} -t {}",
            self.docker(),
            shell_quote(dockerfile),
            shell_quote(tag)
        );
        if let Some(platform) = &self.config.target_platform {
            command.push_str(&format!(" --platform {}", shell_quote(platform)));
        }
        for (key, value) in &self.config.build_args {
            command.push_str(&format!(" --build-arg {}", shell_quote(&format!("{}={}", key, value))));
        }
        command.push(' ');
        command.push_str(&shell_quote(context));

        info!(tag = %tag, dockerfile = %dockerfile, "Building image");
        let outcome = self.run(command, self.config.timeout_seconds).await;
        self.conclude("build", outcome)
    }

    /// Push `image`, tagging it under `registry` first when one is given.
    pub async fn push_image(&self, image: &str, registry: Option<&str>) -> DeployReport {
        let mut report = DeployReport::new("push", DeployStatus::Success);

        let target = match registry.filter(|r| !r.is_empty()) {
            Some(registry) => {
                let target = format!("{}/{}", registry.trim_end_matches('/'), image);
                let tag = self
                    .run(
                        format!("{} tag {} {}", self.docker(), shell_quote(image), shell_quote(&target)),
                        TAG_SECS,
                    )
                    .await;
                let status = DeployStatus::from_outcome(&tag);
                report.outcomes.push(tag);
                if status != DeployStatus::Success {
                    error!(image = %image, target = %target, "Failed to tag image");
                    report.status = status;
                    return report;
                }
                target
            }
            None => image.to_string(),
        };

        info!(image = %target, "Pushing image");
        let push = self
            .run(format!("{} push {}", self.docker(), shell_quote(&target)), PUSH_SECS)
            .await;
        report.status = DeployStatus::from_outcome(&push);
        report.outcomes.push(push);
        report
    }

    pub async fn compose_up(&self, detached: bool) -> DeployReport {
        let file = &self.config.compose_file_path;
        if !Path::new(file).exists() {
            error!(compose_file = %file, "Compose file not found");
            return DeployReport::new("up", DeployStatus::FileNotFound);
        }

        let mut command = format!("{} up", self.compose(file));
        if detached {
            command.push_str(" -d");
        }
        if self.config.pull_on_deploy {
            command.push_str(" --pull always");
        }

        info!(compose_file = %file, detached, "Starting compose services");
        let outcome = self.run(command, self.config.timeout_seconds).await;
        self.conclude("up", outcome)
    }

    pub async fn compose_down(&self, remove_volumes: bool) -> DeployReport {
        let file = &self.config.compose_file_path;
        let mut command = format!("{} down", self.compose(file));
        if remove_volumes {
            command.push_str(" -v");
        }

        info!(compose_file = %file, remove_volumes, "Stopping compose services");
        let outcome = self.run(command, COMPOSE_DOWN_SECS).await;
        self.conclude("down", outcome)
    }

    /// Raw `compose ps` text
    pub async fn compose_ps(&self) -> DeployReport {
        let command = format!("{} ps", self.compose(&self.config.compose_file_path));
        let outcome = self.run(command, COMPOSE_PS_SECS).await;
        self.conclude("ps", outcome)
    }

    pub async fn compose_logs(&self, service: Option<&str>) -> DeployReport {
        let mut command = format!(
            "{} logs --no-color",
            self.compose(&self.config.compose_file_path)
        );
        if let Some(service) = service {
            command.push(' ');
            command.push_str(&shell_quote(service));
        }
        let outcome = self.run(command, COMPOSE_LOGS_SECS).await;
        self.conclude("logs", outcome)
    }

    /// Stop and remove every container, then prune.
    ///
    /// Non-zero exits are expected here (stopping nothing fails) and only logged;
    /// a timeout, a cancellation, or an engine failure fails the whole cleanup.
    pub async fn cleanup(&self, remove_images: bool, remove_volumes: bool) -> DeployReport {
        let d = self.docker();
        let mut steps = vec![
            (format!("{d} stop $({d} ps -aq)"), CLEANUP_STEP_SECS),
            (format!("{d} rm $({d} ps -aq)"), CLEANUP_STEP_SECS),
            (format!("{d} network prune -f"), CLEANUP_STEP_SECS),
        ];
        if remove_images {
            steps.push((format!("{d} image prune -f"), CLEANUP_STEP_SECS));
            steps.push((format!("{d} rmi $({d} images -q) -f"), REMOVE_IMAGES_SECS));
        }
        if remove_volumes {
            steps.push((format!("{d} volume prune -f"), CLEANUP_STEP_SECS));
        }
        steps.push((format!("{d} system prune -f"), CLEANUP_STEP_SECS));

        info!(remove_images, remove_volumes, steps = steps.len(), "Starting docker cleanup");

        let mut report = DeployReport::new("cleanup", DeployStatus::Success);
        for (command, timeout) in steps {
            let outcome = self.run(command, timeout).await;
            let status = DeployStatus::from_outcome(&outcome);
            let stop = status == DeployStatus::Cancelled;

            match status {
                DeployStatus::Success => {}
                DeployStatus::Failed if !outcome.is_engine_failure() => {
                    warn!(command = %outcome.command, exit_code = ?outcome.exit_code(), "Cleanup step failed, continuing");
                }
                other => {
                    warn!(command = %outcome.command, status = ?other, "Cleanup step did not complete");
                    report.status = other;
                }
            }
            report.outcomes.push(outcome);
            if stop {
                break;
            }
        }
        report
    }

    /// Check, build `<project>:latest`, bring the stack up, then optionally prune
    /// dangling images. Stops at the first stage that does not succeed.
    pub async fn deploy(&mut self) -> DeployReport {
        let mut report = DeployReport::new("deploy", DeployStatus::Success);
        info!(project = %self.config.project_name, "Starting deployment");

        let check = self.check_environment().await;
        if !absorb_stage(&mut report, check) {
            return report;
        }

        let dockerfile = self.config.dockerfile_path.clone();
        let context = self.config.build_context.clone();
        let build = self
            .build_image(&dockerfile, &self.config.image_tag(), &context)
            .await;
        if !absorb_stage(&mut report, build) {
            return report;
        }

        let up = self.compose_up(true).await;
        if !absorb_stage(&mut report, up) {
            return report;
        }

        if self.config.prune_after_deploy {
            let prune = self
                .run(format!("{} image prune -f", self.docker()), CLEANUP_STEP_SECS)
                .await;
            if !prune.success() {
                warn!(exit_code = ?prune.exit_code(), "Image prune after deploy failed");
            }
            report.outcomes.push(prune);
        }

        info!(project = %self.config.project_name, "Deployment completed");
        report
    }

    fn conclude(&self, operation: &str, outcome: ExecutionOutcome) -> DeployReport {
        let status = DeployStatus::from_outcome(&outcome);
        if status == DeployStatus::Success {
            info!(operation, duration_ms = outcome.duration_ms, "Operation succeeded");
        } else {
            warn!(
                operation,
                status = ?status,
                exit_code = ?outcome.exit_code(),
                "Operation did not succeed"
            );
        }
        DeployReport::new(operation, status).with_outcome(outcome)
    }
}

/// Moves a stage's outcomes into `report`; false when the stage did not succeed.
fn absorb_stage(report: &mut DeployReport, stage: DeployReport) -> bool {
    report.outcomes.extend(stage.outcomes);
    if stage.status != DeployStatus::Success {
        error!(stage = %stage.operation, status = ?stage.status, "Deployment stage failed");
        report.status = stage.status;
        return false;
    }
    true
}

/// Quote one argument for the platform shell. Plain words pass through untouched.
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if plain {
        return arg.to_string();
    }
    if cfg!(windows) {
        format!("\"{}\"", arg.replace('"', "\\\""))
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use dockbridge_core::Termination;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Records every command and answers from a script; unscripted commands exit 0.
    #[derive(Default)]
    struct ScriptedExecutor {
        commands: Mutex<Vec<CommandSpec>>,
        script: Mutex<VecDeque<Termination>>,
    }

    impl ScriptedExecutor {
        fn with_script(script: Vec<Termination>) -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
                script: Mutex::new(script.into()),
            }
        }

        fn commands(&self) -> Vec<String> {
            self.commands
                .lock()
                .unwrap()
                .iter()
                .map(|s| s.command.clone())
                .collect()
        }
    }

    #[async_trait]
    impl CommandExecutor for ScriptedExecutor {
        async fn execute(&self, spec: &CommandSpec) -> ExecutionOutcome {
            self.commands.lock().unwrap().push(spec.clone());
            let termination = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Termination::Exited { code: 0 });
            let now = Utc::now();
            ExecutionOutcome {
                id: Uuid::new_v4(),
                command: spec.command.clone(),
                termination,
                output: String::new(),
                pid: None,
                duration_ms: 0,
                started_at: now,
                completed_at: now,
            }
        }
    }

    fn exited(code: i32) -> Termination {
        Termination::Exited { code }
    }

    /// Config pointing at real files inside `dir`, with `sh` standing in for docker
    /// so the PATH lookup succeeds.
    fn config_in(dir: &Path) -> DeployConfig {
        let dockerfile = dir.join("Dockerfile");
        let compose = dir.join("docker-compose.yml");
        std::fs::write(&dockerfile, "FROM scratch\n").unwrap();
        std::fs::write(&compose, "version: '3.8'\n").unwrap();

        DeployConfig {
            project_name: "shop".to_string(),
            dockerfile_path: dockerfile.to_string_lossy().into_owned(),
            compose_file_path: compose.to_string_lossy().into_owned(),
            docker_path: "sh".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("myapp:latest"), "myapp:latest");
        assert_eq!(shell_quote("./Dockerfile"), "./Dockerfile");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("my dir/file"), "'my dir/file'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[tokio::test]
    async fn test_build_image_missing_dockerfile() {
        let executor = ScriptedExecutor::default();
        let orchestrator = DockerOrchestrator::new(&executor, DeployConfig::default());

        let report = orchestrator
            .build_image("/definitely/not/here/Dockerfile", "app:latest", ".")
            .await;

        assert_eq!(report.status, DeployStatus::FileNotFound);
        assert!(executor.commands().is_empty());
    }

    #[tokio::test]
    async fn test_build_image_command_line() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::default();
        let mut config = config_in(dir.path());
        config.docker_path = "docker".to_string();
        config.target_platform = Some("linux/amd64".to_string());
        config
            .build_args
            .insert("VERSION".to_string(), "1.2".to_string());
        let dockerfile = config.dockerfile_path.clone();
        let orchestrator = DockerOrchestrator::new(&executor, config);

        let report = orchestrator.build_image(&dockerfile, "shop:latest", ".").await;

        assert_eq!(report.status, DeployStatus::Success);
        let commands = executor.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(
            commands[0],
            format!(
                "docker build -f {} -t shop:latest --platform linux/amd64 --build-arg VERSION=1.2 .",
                shell_quote(&dockerfile)
            )
        );
        let specs = executor.commands.lock().unwrap();
        assert_eq!(specs[0].timeout, Some(std::time::Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn test_build_timeout_maps_to_timeout_status() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::with_script(vec![Termination::TimedOut]);
        let config = config_in(dir.path());
        let dockerfile = config.dockerfile_path.clone();
        let orchestrator = DockerOrchestrator::new(&executor, config);

        let report = orchestrator.build_image(&dockerfile, "shop:latest", ".").await;
        assert_eq!(report.status, DeployStatus::Timeout);
        assert_eq!(report.outcomes.len(), 1);
    }

    #[tokio::test]
    async fn test_compose_up_flags() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::default();
        let mut config = config_in(dir.path());
        config.pull_on_deploy = true;
        let compose_file = config.compose_file_path.clone();
        let orchestrator = DockerOrchestrator::new(&executor, config);

        let report = orchestrator.compose_up(true).await;

        assert!(report.is_success());
        assert_eq!(
            executor.commands(),
            vec![format!(
                "docker-compose -f {} up -d --pull always",
                shell_quote(&compose_file)
            )]
        );
    }

    #[tokio::test]
    async fn test_compose_up_missing_file() {
        let executor = ScriptedExecutor::default();
        let config = DeployConfig {
            compose_file_path: "/definitely/not/here/docker-compose.yml".to_string(),
            ..Default::default()
        };
        let orchestrator = DockerOrchestrator::new(&executor, config);

        let report = orchestrator.compose_up(false).await;
        assert_eq!(report.status, DeployStatus::FileNotFound);
        assert!(executor.commands().is_empty());
    }

    #[tokio::test]
    async fn test_compose_down_non_zero_exit_is_failed() {
        let executor = ScriptedExecutor::with_script(vec![exited(1)]);
        let orchestrator = DockerOrchestrator::new(&executor, DeployConfig::default());

        let report = orchestrator.compose_down(true).await;

        assert_eq!(report.status, DeployStatus::Failed);
        assert_eq!(
            executor.commands(),
            vec!["docker-compose -f docker-compose.yml down -v".to_string()]
        );
    }

    #[tokio::test]
    async fn test_compose_logs_for_service() {
        let executor = ScriptedExecutor::default();
        let orchestrator = DockerOrchestrator::new(&executor, DeployConfig::default());

        orchestrator.compose_logs(Some("web")).await;
        assert_eq!(
            executor.commands(),
            vec!["docker-compose -f docker-compose.yml logs --no-color web".to_string()]
        );
    }

    #[tokio::test]
    async fn test_push_with_registry_tags_first() {
        let executor = ScriptedExecutor::default();
        let orchestrator = DockerOrchestrator::new(&executor, DeployConfig::default());

        let report = orchestrator
            .push_image("shop:latest", Some("registry.example.com/team/"))
            .await;

        assert!(report.is_success());
        assert_eq!(
            executor.commands(),
            vec![
                "docker tag shop:latest registry.example.com/team/shop:latest".to_string(),
                "docker push registry.example.com/team/shop:latest".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_push_stops_when_tag_fails() {
        let executor = ScriptedExecutor::with_script(vec![exited(1)]);
        let orchestrator = DockerOrchestrator::new(&executor, DeployConfig::default());

        let report = orchestrator.push_image("shop:latest", Some("registry.local")).await;

        assert_eq!(report.status, DeployStatus::Failed);
        assert_eq!(executor.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_tolerates_non_zero_exits() {
        let executor = ScriptedExecutor::with_script(vec![exited(1), exited(1)]);
        let orchestrator = DockerOrchestrator::new(&executor, DeployConfig::default());

        let report = orchestrator.cleanup(true, true).await;

        assert_eq!(report.status, DeployStatus::Success);
        assert_eq!(
            executor.commands(),
            vec![
                "docker stop $(docker ps -aq)".to_string(),
                "docker rm $(docker ps -aq)".to_string(),
                "docker network prune -f".to_string(),
                "docker image prune -f".to_string(),
                "docker rmi $(docker images -q) -f".to_string(),
                "docker volume prune -f".to_string(),
                "docker system prune -f".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_cleanup_reports_timeout_but_continues() {
        let executor = ScriptedExecutor::with_script(vec![Termination::TimedOut]);
        let orchestrator = DockerOrchestrator::new(&executor, DeployConfig::default());

        let report = orchestrator.cleanup(false, false).await;

        assert_eq!(report.status, DeployStatus::Timeout);
        assert_eq!(report.outcomes.len(), 4);
    }

    #[tokio::test]
    async fn test_cleanup_stops_when_cancelled() {
        let executor =
            ScriptedExecutor::with_script(vec![exited(0), Termination::Cancelled]);
        let orchestrator = DockerOrchestrator::new(&executor, DeployConfig::default());

        let report = orchestrator.cleanup(false, false).await;

        assert_eq!(report.status, DeployStatus::Cancelled);
        assert_eq!(executor.commands().len(), 2);
    }

    #[tokio::test]
    async fn test_check_environment_missing_docker_binary() {
        let executor = ScriptedExecutor::default();
        let config = DeployConfig {
            docker_path: "dockbridge-no-such-docker-binary".to_string(),
            ..Default::default()
        };
        let mut orchestrator = DockerOrchestrator::new(&executor, config);

        let report = orchestrator.check_environment().await;
        assert_eq!(report.status, DeployStatus::DockerNotFound);
        assert!(executor.commands().is_empty());
    }

    #[tokio::test]
    async fn test_check_environment_falls_back_to_compose_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::with_script(vec![exited(0), exited(127), exited(0)]);
        let mut orchestrator = DockerOrchestrator::new(&executor, config_in(dir.path()));

        let report = orchestrator.check_environment().await;

        assert_eq!(report.status, DeployStatus::Success);
        assert_eq!(
            executor.commands(),
            vec![
                "sh --version".to_string(),
                "docker-compose --version".to_string(),
                "sh compose version".to_string(),
            ]
        );
        assert_eq!(orchestrator.compose_program(), "sh compose");
    }

    #[tokio::test]
    async fn test_check_environment_without_any_compose() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::with_script(vec![exited(0), exited(127), exited(1)]);
        let mut orchestrator = DockerOrchestrator::new(&executor, config_in(dir.path()));

        let report = orchestrator.check_environment().await;
        assert_eq!(report.status, DeployStatus::ComposeNotFound);
        assert_eq!(report.outcomes.len(), 3);
    }

    #[tokio::test]
    async fn test_deploy_runs_all_stages() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::default();
        let mut config = config_in(dir.path());
        config.prune_after_deploy = true;
        let mut orchestrator = DockerOrchestrator::new(&executor, config);

        let report = orchestrator.deploy().await;

        assert!(report.is_success());
        let commands = executor.commands();
        assert_eq!(commands.len(), 5);
        assert_eq!(commands[0], "sh --version");
        assert!(commands[2].starts_with("sh build -f "));
        assert!(commands[2].contains("-t shop:latest"));
        assert!(commands[3].contains(" up -d"));
        assert_eq!(commands[4], "sh image prune -f");
    }

    #[tokio::test]
    async fn test_deploy_stops_after_failed_build() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::with_script(vec![exited(0), exited(0), exited(2)]);
        let mut orchestrator = DockerOrchestrator::new(&executor, config_in(dir.path()));

        let report = orchestrator.deploy().await;

        assert_eq!(report.status, DeployStatus::Failed);
        assert_eq!(executor.commands().len(), 3);
        assert_eq!(report.outcomes.len(), 3);
    }
}
