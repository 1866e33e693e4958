//! End-to-end runs of the uid/gid migration against an in-memory host.

mod helpers;

use std::cell::RefCell;

use camino::Utf8Path;
use helpers::{FakeHost, resolve, state_dir};
use pgprovision::ProvisionError;
use pgprovision::config::ProvisionConfig;
use pgprovision::confirm::Confirm;
use pgprovision::context::StepOutcome;
use pgprovision::error::PreflightKind;
use pgprovision::plans::migrate::{CHANGE_GID, CHANGE_UID, RESTAMP_OWNERSHIP, SWEEP_LEFTOVERS};
use pgprovision::runner::{RunOptions, RunReport, RunStatus};

/// Answers every prompt the same way and remembers what was asked.
struct Answer {
    approve: bool,
    prompts: RefCell<Vec<String>>,
}

impl Answer {
    fn new(approve: bool) -> Self {
        Self {
            approve,
            prompts: RefCell::default(),
        }
    }
}

impl Confirm for Answer {
    fn confirm(&self, prompt: &str) -> anyhow::Result<bool> {
        self.prompts.borrow_mut().push(prompt.to_string());
        Ok(self.approve)
    }
}

fn config(state: &Utf8Path, ids: &str) -> ProvisionConfig {
    resolve(&format!(
        r#"
account:
{}
migration:
  roots: [/var/lib/postgresql, /var/log/postgresql]
state_dir: {}
"#,
        ids, state
    ))
}

/// A host whose postgres account sits at 152:152.
fn legacy_host() -> FakeHost {
    FakeHost::new()
        .with_account("postgres", 152, 152)
        .with_dir("/var/lib/postgresql", 152, 152, 0o755)
        .with_dir("/var/lib/postgresql/14/main", 152, 152, 0o700)
        .with_file("/var/lib/postgresql/14/main/PG_VERSION", "14\n", 152, 152)
        .with_dir("/var/log/postgresql", 152, 152, 0o750)
        .with_file("/var/log/postgresql/postgresql-14-main.log", "", 152, 152)
        .with_file("/tmp/.s.PGSQL.5432.lock", "", 152, 152)
        .with_file("/etc/postgresql/14/main/pg_hba.conf", "", 0, 152)
        .with_dir("/home/alice", 1000, 1000, 0o700)
        .with_shm(7, 152)
        .with_shm(8, 1000)
}

fn migrate(
    config: &ProvisionConfig,
    fake: &FakeHost,
    uid: Option<u32>,
    gid: Option<u32>,
    dry_run: bool,
    confirm: &dyn Confirm,
) -> Result<RunReport, ProvisionError> {
    let options = RunOptions {
        state_dir: config.state_dir.clone(),
        dry_run,
    };
    pgprovision::migrate(config, &fake.host(), uid, gid, &options, confirm)
}

#[test]
fn account_moves_and_no_file_keeps_the_old_ids() {
    let (_guard, state) = state_dir();
    let config = config(&state, "  uid: 153\n  gid: 153");
    let fake = legacy_host();
    let answer = Answer::new(true);

    let report = migrate(&config, &fake, None, None, false, &answer).unwrap();

    assert_eq!(report.status, RunStatus::Success, "{:?}", report.verification);
    assert_eq!(fake.identity("postgres"), Some((153, 153)));
    assert_eq!(fake.state().groups.get("postgres"), Some(&153));
    assert!(fake.owned_by(152, 152, state.as_str()).is_empty());
    let lock = fake.node("/tmp/.s.PGSQL.5432.lock").unwrap();
    assert_eq!((lock.uid, lock.gid), (153, 153));
    let hba = fake.node("/etc/postgresql/14/main/pg_hba.conf").unwrap();
    assert_eq!((hba.uid, hba.gid), (0, 153));
    assert_eq!(fake.node("/home/alice").unwrap().uid, 1000);
    assert_eq!(fake.state().shm, vec![(8, 1000)]);

    let calls = fake.calls();
    let position = |call: &str| calls.iter().position(|c| c == call).unwrap();
    assert!(position("groupmod -g 153 postgres") < position("usermod -u 153 postgres"));
    assert!(position("usermod -u 153 postgres") < position("chown /var/lib/postgresql 153:153"));

    let prompts = answer.prompts.borrow();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("from uid 152 / gid 152 to uid 153 / gid 153"));

    let verification = report.verification.unwrap();
    assert_eq!(verification.checks.len(), 4);
    assert!(verification.all_passed());
    assert_eq!(report.context.target.uid, Some(153));
}

#[test]
fn cli_ids_override_the_profile() {
    let (_guard, state) = state_dir();
    let config = config(&state, "  uid: 153\n  gid: 153");
    let fake = legacy_host();

    let report = migrate(&config, &fake, Some(170), Some(171), false, &Answer::new(true)).unwrap();

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(fake.identity("postgres"), Some((170, 171)));
}

#[test]
fn changing_only_the_gid_keeps_the_uid() {
    let (_guard, state) = state_dir();
    let config = config(&state, "  user: postgres");
    let fake = legacy_host();

    let report = migrate(&config, &fake, None, Some(160), false, &Answer::new(true)).unwrap();

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(fake.identity("postgres"), Some((152, 160)));
    let data = fake.node("/var/lib/postgresql/14/main").unwrap();
    assert_eq!((data.uid, data.gid), (152, 160));
    let hba = fake.node("/etc/postgresql/14/main/pg_hba.conf").unwrap();
    assert_eq!((hba.uid, hba.gid), (0, 160));
    assert!(!fake.calls().iter().any(|c| c.starts_with("usermod")));
    assert_eq!(fake.state().shm.len(), 2);
}

#[test]
fn missing_target_ids_are_rejected() {
    let (_guard, state) = state_dir();
    let config = config(&state, "  user: postgres");
    let fake = legacy_host();

    let err = migrate(&config, &fake, None, None, false, &Answer::new(true)).unwrap_err();

    assert!(matches!(err, ProvisionError::Validation(_)), "{}", err);
    assert!(fake.calls().is_empty());
}

#[test]
fn declined_confirmation_changes_nothing() {
    let (_guard, state) = state_dir();
    let config = config(&state, "  uid: 153\n  gid: 153");
    let fake = legacy_host();

    let err = migrate(&config, &fake, None, None, false, &Answer::new(false)).unwrap_err();

    assert!(matches!(err, ProvisionError::Declined(_)), "{}", err);
    assert!(fake.calls().is_empty());
    assert_eq!(fake.identity("postgres"), Some((152, 152)));
}

#[test]
fn taken_uid_fails_preflight() {
    let (_guard, state) = state_dir();
    let config = config(&state, "  uid: 153\n  gid: 152");
    let fake = legacy_host().with_account("backup", 153, 153);
    let answer = Answer::new(true);

    let err = migrate(&config, &fake, None, None, false, &answer).unwrap_err();

    assert_eq!(err.preflight_kind(), Some(PreflightKind::IdInUse));
    assert!(err.to_string().contains("backup"), "{}", err);
    assert!(answer.prompts.borrow().is_empty());
    assert!(fake.calls().is_empty());
}

#[test]
fn running_service_fails_preflight() {
    let (_guard, state) = state_dir();
    let config = config(&state, "  uid: 153\n  gid: 153");
    let fake = legacy_host().with_service(true, true);

    let err = migrate(&config, &fake, None, None, false, &Answer::new(true)).unwrap_err();

    assert_eq!(err.preflight_kind(), Some(PreflightKind::ServiceActive));
    assert!(fake.calls().is_empty());
}

#[test]
fn unknown_account_is_reported_before_planning() {
    let (_guard, state) = state_dir();
    let config = config(&state, "  uid: 153\n  gid: 153");
    let fake = FakeHost::new();

    let err = migrate(&config, &fake, None, None, false, &Answer::new(true)).unwrap_err();

    assert_eq!(err.preflight_kind(), Some(PreflightKind::UnknownAccount));
}

#[test]
fn unreadable_paths_do_not_stop_the_sweep() {
    let (_guard, state) = state_dir();
    let config = config(&state, "  uid: 153\n  gid: 153");
    let fake = legacy_host().unreadable("/home/alice");

    let report = migrate(&config, &fake, None, None, false, &Answer::new(true)).unwrap();

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.context.outcome(SWEEP_LEFTOVERS), Some(StepOutcome::Succeeded));
    let lock = fake.node("/tmp/.s.PGSQL.5432.lock").unwrap();
    assert_eq!(lock.uid, 153);
    let verification = report.verification.unwrap();
    let sweep = verification
        .checks
        .iter()
        .find(|c| c.name.starts_with("no leftovers"))
        .unwrap();
    assert!(sweep.reason.contains("1 unreadable entries skipped"), "{}", sweep.reason);
}

#[test]
fn failed_sweep_chown_is_a_warning() {
    let (_guard, state) = state_dir();
    let config = config(&state, "  uid: 153\n  gid: 153");
    let fake = legacy_host().failing_on("chown /tmp/.s.PGSQL.5432.lock");

    let report = migrate(&config, &fake, None, None, false, &Answer::new(true)).unwrap();

    assert_eq!(report.status, RunStatus::CompletedWithWarnings);
    assert_eq!(fake.identity("postgres"), Some((153, 153)));
    let verification = report.verification.unwrap();
    let failed: Vec<&str> = verification.failures().map(|c| c.name.as_str()).collect();
    assert_eq!(failed, vec!["no leftovers owned by uid 152 / gid 152"]);
}

#[test]
fn failed_uid_change_stops_before_restamping() {
    let (_guard, state) = state_dir();
    let config = config(&state, "  uid: 153\n  gid: 153");
    let fake = legacy_host().failing_on("usermod");

    let report = migrate(&config, &fake, None, None, false, &Answer::new(true)).unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    match report.failure.as_ref().unwrap() {
        ProvisionError::Mutation { step, completed, .. } => {
            assert_eq!(step, CHANGE_UID);
            assert_eq!(completed, &[CHANGE_GID.to_string()]);
        }
        other => panic!("unexpected failure: {}", other),
    }
    assert_eq!(report.context.outcome(RESTAMP_OWNERSHIP), Some(StepOutcome::Pending));
    assert!(!fake.calls_outside(state.as_str()).iter().any(|c| c.starts_with("chown")));
    assert_eq!(fake.identity("postgres").map(|(uid, _)| uid), Some(152));
}

#[test]
fn dry_run_neither_prompts_nor_mutates() {
    let (_guard, state) = state_dir();
    let config = config(&state, "  uid: 153\n  gid: 153");
    let fake = legacy_host();
    let answer = Answer::new(false);

    let report = migrate(&config, &fake, None, None, true, &answer).unwrap();

    assert_eq!(report.status, RunStatus::Success);
    assert!(answer.prompts.borrow().is_empty());
    assert!(fake.calls().is_empty());
    assert_eq!(fake.identity("postgres"), Some((152, 152)));
}
