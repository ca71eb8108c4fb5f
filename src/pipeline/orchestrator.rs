//! Orchestrator - runs one verification end to end

use crate::backup::{AgeDecryptor, BackupSource, BackupStream};
use crate::config::Settings;
use crate::error::{environment_error, AppResult};
use crate::pipeline::types::{BaselineAction, RunOutcome, SigningState};
use crate::report::{sign, Report, ReportBuilder, ReportStore, REPORT_VERSION};
use crate::restore::container::InstanceCredentials;
use crate::restore::{DockerPostgres, EphemeralInstance, RestoreOrchestrator};
use crate::snapshot::diff::DiffEngine;
use crate::snapshot::{BaselineStore, CheckEngine};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Collaborators built from configuration before anything touches the environment
struct RunPlan {
    source: BackupSource,
    decryptor: Option<AgeDecryptor>,
    engine: CheckEngine,
    baselines: BaselineStore,
    reports: ReportStore,
}

/// The verify pipeline for one project
pub struct VerifyPipeline {
    settings: Settings,
    run_id: String,
    deadline: Duration,
}

impl VerifyPipeline {
    pub fn new(settings: Settings) -> Self {
        let deadline = Duration::from_secs(settings.docker.timeout_minutes * 60);
        Self {
            settings,
            run_id: Uuid::new_v4().to_string(),
            deadline,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    #[cfg(test)]
    pub(crate) fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Run against a Docker-provisioned PostgreSQL instance
    pub async fn run(&self) -> AppResult<RunOutcome> {
        let db = &self.settings.database;
        let credentials = InstanceCredentials {
            user: db.restore.user.clone(),
            password: db.restore.resolve_password()?,
            db_name: db.restore.db_name.clone(),
        };
        let instance = DockerPostgres::new(
            self.settings.docker.clone(),
            db.docker_image(),
            credentials,
            self.run_id.clone(),
        );
        self.run_with(instance).await
    }

    /// Run against any ephemeral instance; cleanup runs whatever happens
    pub async fn run_with<I: EphemeralInstance>(&self, instance: I) -> AppResult<RunOutcome> {
        let plan = self.plan().await?;
        info!(
            run_id = self.run_id.as_str(),
            project = self.settings.project.id.as_str(),
            "Starting verification"
        );

        let restore = &self.settings.database.restore;
        let mut restorer = RestoreOrchestrator::new(
            instance,
            restore.user.clone(),
            restore.db_name.clone(),
            self.settings.temp_dir(),
        );

        let result = tokio::time::timeout(self.deadline, self.execute(&plan, &mut restorer)).await;

        match restorer.cleanup().await {
            Ok(()) => info!("Ephemeral environment cleaned up"),
            Err(e) => error!("Cleanup failed, resources may need manual removal: {}", e),
        }

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(environment_error(format!(
                "verification exceeded the {}s deadline",
                self.deadline.as_secs()
            ))),
        }
    }

    async fn plan(&self) -> AppResult<RunPlan> {
        let settings = &self.settings;
        let decryptor = settings
            .encryption
            .as_ref()
            .map(|enc| AgeDecryptor::from_config(enc, settings.temp_dir()))
            .transpose()?;

        let engine = CheckEngine::from_config(&settings.verification)?;
        let baselines = BaselineStore::open(settings.baseline_dir()).await?;
        debug!(
            checks = %engine.kinds().join(","),
            baselines = %baselines.base_path().display(),
            "Run plan ready"
        );

        Ok(RunPlan {
            source: BackupSource::from_config(&settings.backup)?,
            decryptor,
            engine,
            baselines,
            reports: ReportStore::new(settings.report_dir()),
        })
    }

    async fn execute<I: EphemeralInstance>(
        &self,
        plan: &RunPlan,
        restorer: &mut RestoreOrchestrator<I>,
    ) -> AppResult<RunOutcome> {
        let project = &self.settings.project;

        let stream = self.acquire(plan).await?;
        restorer.restore(stream).await?;

        let schema = restorer.extract_schema().await?;
        let metrics = restorer.extract_metrics().await?;
        info!(
            "Extracted {} tables, {} rows",
            schema.tables.len(),
            metrics.total_rows()
        );

        let baseline = plan.baselines.load(&project.id).await?;
        match &baseline {
            None => info!("No baseline for project {}, treating as first verification run", project.id),
            Some(baseline) => {
                let diff = DiffEngine::diff(baseline, &schema);
                if diff.is_empty() {
                    debug!("Schema matches baseline");
                } else {
                    info!(
                        missing = diff.missing_tables.len(),
                        new = diff.new_tables.len(),
                        column_changes = diff.column_changes.len(),
                        "Schema differs from baseline"
                    );
                }
            }
        }
        let checks = plan.engine.run(&schema, baseline.as_ref(), Some(&metrics));

        let mut report = ReportBuilder::new(REPORT_VERSION)
            .id(self.run_id.clone())
            .project(project.id.clone(), project.name.clone())
            .machine_id(self.settings.machine_id())
            .backup_source(plan.source.identifier())
            .database(
                self.settings.database.db_type.clone(),
                self.settings.database.major_version,
            )
            .schema(schema)
            .metrics(metrics)
            .checks(checks)
            .build()?;

        let signing = self.sign_report(&mut report);
        let report_path = plan.reports.write(&report).await?;
        info!("Report written to {}", report_path.display());

        let baseline_exists = plan.baselines.exists(&project.id).await?;
        let action = BaselineAction::decide(
            self.settings.verification.baseline_policy,
            baseline_exists,
            report.summary.failed_checks,
            &signing,
        );
        if action.writes() {
            plan.baselines.save(&project.id, &report.schema).await?;
        }
        info!(
            policy = ?self.settings.verification.baseline_policy,
            "Baseline {}",
            action
        );

        Ok(RunOutcome {
            report,
            report_path,
            signing,
            baseline: action,
        })
    }

    async fn acquire(&self, plan: &RunPlan) -> AppResult<BackupStream> {
        info!("Acquiring backup from {}", plan.source.identifier());
        let stream = plan
            .source
            .acquire()
            .await
            .map_err(|e| e.in_stage("acquire"))?;

        match &plan.decryptor {
            Some(decryptor) => {
                info!("Decrypting backup with age identities from {}", decryptor.origin());
                decryptor
                    .decrypt(stream)
                    .await
                    .map_err(|e| e.in_stage("decrypt"))
            }
            None => {
                debug!("Backup is not encrypted, skipping decryption");
                Ok(stream)
            }
        }
    }

    fn sign_report(&self, report: &mut Report) -> SigningState {
        let Some(key_path) = &self.settings.signing.private_key_path else {
            warn!("No signing key configured, report will be unsigned");
            return SigningState::Unsigned;
        };

        match sign::load_signing_key(key_path).and_then(|key| sign::sign(report, &key)) {
            Ok(()) => {
                info!("Report signed");
                SigningState::Signed
            }
            Err(e) => {
                report.signature = None;
                error!("Signing failed, report will be persisted unsigned: {}", e);
                SigningState::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, EXIT_ENVIRONMENT};
    use crate::introspection::{Column, SchemaSnapshot, Table};
    use crate::pipeline::types::RunStatus;
    use crate::report::sign::{generate_key_files, load_verifying_key, verify};
    use crate::restore::postgres::tests::FakeInstance;
    use std::path::{Path, PathBuf};

    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("billing.dump"), b"PGDMP").unwrap();
            Self { dir }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn signing_key(&self) -> PathBuf {
            let key = self.path("keys/signing.key");
            generate_key_files(&key).unwrap();
            key
        }

        fn settings(&self, key: Option<&Path>, extra: &str) -> Settings {
            let signing = key
                .map(|k| format!("signing:\n  private_key_path: {}\n", k.display()))
                .unwrap_or_default();
            let yaml = format!(
                r#"
project:
  id: billing-db
  name: Billing
cli:
  machine_id: test-host
  report_dir: {reports}
  baseline_dir: {baselines}
  temp_dir: {tmp}
backup:
  source: local
  local:
    path: {dump}
database:
  type: postgres
  major_version: 16
{signing}{extra}"#,
                reports = self.path("reports").display(),
                baselines = self.path("schemas").display(),
                tmp = self.dir.path().display(),
                dump = self.path("billing.dump").display(),
                signing = signing,
                extra = extra,
            );
            Settings::from_yaml(&yaml).unwrap()
        }

        fn report_count(&self) -> usize {
            std::fs::read_dir(self.path("reports"))
                .map(|d| d.count())
                .unwrap_or(0)
        }

        async fn seed_baseline(&self, tables: &[&str]) {
            let store = BaselineStore::open(self.path("schemas")).await.unwrap();
            let snapshot = SchemaSnapshot::new(
                tables
                    .iter()
                    .map(|t| {
                        Table::new(
                            "public",
                            *t,
                            vec![Column {
                                name: "id".into(),
                                data_type: "integer".into(),
                                nullable: false,
                            }],
                        )
                    })
                    .collect(),
            );
            store.save("billing-db", &snapshot).await.unwrap();
        }

        async fn baseline_tables(&self) -> Option<Vec<String>> {
            let store = BaselineStore::open(self.path("schemas")).await.unwrap();
            store
                .load("billing-db")
                .await
                .unwrap()
                .map(|s| s.table_names())
        }
    }

    fn restores_ok() -> FakeInstance {
        FakeInstance::scripted(vec![(0, 0, "pg_restore: done")])
    }

    #[tokio::test]
    async fn test_first_run_signs_report_and_creates_baseline() {
        let fx = Fixture::new();
        let key = fx.signing_key();
        let pipeline = VerifyPipeline::new(fx.settings(Some(&key), ""));

        let outcome = pipeline.run_with(restores_ok()).await.unwrap();

        assert_eq!(outcome.status(), RunStatus::Success);
        assert_eq!(outcome.signing, SigningState::Signed);
        assert_eq!(outcome.baseline, BaselineAction::Created);
        assert_eq!(outcome.report.id, pipeline.run_id());
        assert_eq!(outcome.report.machine_id, "test-host");

        let stored = ReportStore::load(&outcome.report_path).await.unwrap();
        let public = load_verifying_key(&crate::config::public_key_path_for(&key)).unwrap();
        assert!(verify(&stored, &public).unwrap());
        assert_eq!(fx.baseline_tables().await, Some(vec!["public.users".to_string()]));
    }

    #[tokio::test]
    async fn test_missing_table_is_critical_and_frozen_baseline_kept() {
        let fx = Fixture::new();
        fx.seed_baseline(&["orders", "users"]).await;
        let pipeline = VerifyPipeline::new(fx.settings(None, ""));

        let outcome = pipeline.run_with(restores_ok()).await.unwrap();

        assert_eq!(outcome.exit_code(), 2);
        assert_eq!(outcome.report.summary.critical_failures, 1);
        assert_eq!(outcome.signing, SigningState::Unsigned);
        assert_eq!(outcome.baseline, BaselineAction::Kept);
        assert_eq!(
            fx.baseline_tables().await,
            Some(vec!["public.orders".to_string(), "public.users".to_string()])
        );
    }

    #[tokio::test]
    async fn test_refresh_policy_replaces_baseline_after_clean_run() {
        let fx = Fixture::new();
        fx.seed_baseline(&["users"]).await;
        let pipeline = VerifyPipeline::new(
            fx.settings(None, "verification:\n  baseline_policy: refresh\n"),
        );

        let outcome = pipeline.run_with(restores_ok()).await.unwrap();

        assert_eq!(outcome.report.summary.failed_checks, 0);
        assert_eq!(outcome.baseline, BaselineAction::Refreshed);
    }

    #[tokio::test]
    async fn test_signing_failure_persists_unsigned_report_and_skips_baseline() {
        let fx = Fixture::new();
        let missing_key = fx.path("keys/absent.key");
        let pipeline = VerifyPipeline::new(fx.settings(Some(&missing_key), ""));

        let outcome = pipeline.run_with(restores_ok()).await.unwrap();

        assert!(matches!(outcome.signing, SigningState::Failed(_)));
        assert_eq!(outcome.exit_code(), 2);
        assert!(!outcome.report.is_signed());
        assert!(outcome.report_path.exists());
        assert_eq!(outcome.baseline, BaselineAction::SkippedSigningFailure);
        assert_eq!(fx.baseline_tables().await, None);
    }

    #[tokio::test]
    async fn test_restore_failure_produces_no_report() {
        let fx = Fixture::new();
        let pipeline = VerifyPipeline::new(fx.settings(None, ""));
        let instance = FakeInstance::scripted(vec![(0, 1, "bad archive"), (0, 1, "bad sql")]);
        let terminated = instance.terminated.clone();

        let err = pipeline.run_with(instance).await.unwrap_err();

        assert!(matches!(err, AppError::Restore(_)));
        assert_eq!(terminated.get(), 1);
        assert_eq!(err.exit_code(), 2);
        assert_eq!(fx.report_count(), 0);
        assert_eq!(fx.baseline_tables().await, None);
    }

    #[tokio::test]
    async fn test_deadline_is_environment_failure() {
        let fx = Fixture::new();
        let pipeline = VerifyPipeline::new(fx.settings(None, ""))
            .with_deadline(Duration::from_millis(100));
        let slow = FakeInstance::scripted(vec![(2_000, 0, "")]);
        let terminated = slow.terminated.clone();

        let started = std::time::Instant::now();
        let err = pipeline.run_with(slow).await.unwrap_err();

        assert_eq!(err.exit_code(), EXIT_ENVIRONMENT);
        assert!(err.to_string().contains("deadline"));
        assert!(started.elapsed() < Duration::from_millis(1_500));
        // Teardown still ran after the timed-out restore was abandoned
        assert_eq!(terminated.get(), 1);
        assert_eq!(fx.report_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_checker_fails_before_restore() {
        let fx = Fixture::new();
        let pipeline = VerifyPipeline::new(
            fx.settings(None, "verification:\n  checks: [tables_exist, bogus]\n"),
        );
        let instance = FakeInstance::scripted(vec![]);
        let terminated = instance.terminated.clone();

        let err = pipeline.run_with(instance).await.unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert_eq!(terminated.get(), 0);
    }
}
