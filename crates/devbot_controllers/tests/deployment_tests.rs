//! Deployment-Controller: Clone → Bake → Apply

use std::path::{Path, PathBuf};

use devbot_api::conditions::StaleReason;
use devbot_api::{Application, Deployment, ManagedObject, MissingBranchStrategy};
use devbot_config::ApplyMode;
use devbot_controllers::test_utils::{Tool, World, NAMESPACE};
use devbot_reconcile::Store;

const SHA: &str = "1111111111111111111111111111111111111111";
const NEXT_SHA: &str = "2222222222222222222222222222222222222222";

async fn world_with_main() -> World {
    let world = World::new();
    world.add_repository("web", "main", &[("main", SHA)]);
    world.add_application("myapp", &[("web", MissingBranchStrategy::UseDefaultBranch)]);
    world
}

/// Reconciled Runden, bis `done` gilt.
async fn until(world: &World, done: impl Fn(&World) -> bool) {
    for _ in 0..50 {
        if done(world) {
            return;
        }
        world.reconcile_all().await;
    }
    panic!("condition not reached");
}

fn main_deployment(world: &World) -> Deployment {
    world.deployment("myapp", "main", "web")
}

fn clone_path(world: &World) -> PathBuf {
    PathBuf::from(main_deployment(world).status.unwrap().clone_path)
}

// ============================================================================
// Workspace
// ============================================================================

#[tokio::test]
async fn test_workspace_is_partitioned_by_repository() {
    let world = world_with_main().await;
    world.converge().await;

    let deployment = main_deployment(&world);
    let status = deployment.status.unwrap();
    let path = PathBuf::from(&status.clone_path);
    let relative = path.strip_prefix(world.workspace.path()).unwrap();
    let parts: Vec<_> = relative.iter().map(|p| p.to_str().unwrap().to_string()).collect();
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[0], NAMESPACE);
    assert_eq!(parts[1], "web");
    assert_eq!(parts[2].len(), 7);
    assert!(path.join(".git").exists());
    assert_eq!(status.persistent_volume_claim_name.as_deref(), Some("devbot-data"));
}

#[tokio::test]
async fn test_deleting_deployment_removes_workspace() {
    let world = world_with_main().await;
    world.converge().await;
    let deployment = main_deployment(&world);
    let path = clone_path(&world);
    assert!(path.exists());

    world.store.delete::<Deployment>(&deployment.key()).await.unwrap();
    world.deployments.reconcile(&deployment.key()).await.unwrap();

    assert!(world.store.get_now::<Deployment>(&deployment.key()).is_none());
    assert!(!path.exists());
}

// ============================================================================
// Clone
// ============================================================================

#[tokio::test]
async fn test_clone_failure_is_retried() {
    let world = world_with_main().await;
    world.tools.fail_next(Tool::Clone, "network down");

    until(&world, |w| w.tools.count(Tool::Clone) >= 1).await;

    let status = main_deployment(&world).status.unwrap();
    assert!(status.conditions.has_reason(StaleReason::CloneFailed));
    assert!(status.conditions.get::<StaleReason>().unwrap().message.contains("network down"));
    assert_eq!(status.last_applied_revision, "");

    world.converge().await;

    assert_eq!(world.tools.count(Tool::Clone), 2);
    assert_eq!(main_deployment(&world).status.unwrap().last_applied_revision, SHA);
}

#[tokio::test]
async fn test_lost_clone_is_recloned() {
    let world = world_with_main().await;
    world.converge().await;
    let path = clone_path(&world);

    std::fs::remove_dir_all(&path).unwrap();
    world.converge().await;

    assert!(path.join(".git").exists());
    assert_eq!(world.tools.count(Tool::Clone), 2);
    // gleicher Head, nichts anzuwenden
    assert_eq!(world.tools.count(Tool::Apply), 1);
}

#[tokio::test]
async fn test_pull_failure() {
    let world = world_with_main().await;
    world.converge().await;

    world.tools.fail_next(Tool::Pull, "connection reset");
    world.reconcile_all().await;

    let status = main_deployment(&world).status.unwrap();
    assert!(status.conditions.has_reason(StaleReason::PullFailed));
    assert_eq!(status.last_applied_revision, SHA);

    world.converge().await;
    assert!(main_deployment(&world).status.unwrap().current);
}

// ============================================================================
// Bake
// ============================================================================

#[tokio::test]
async fn test_application_specific_kustomization_wins() {
    let world = world_with_main().await;
    world.converge().await;
    let path = clone_path(&world);

    let specific = path.join(".devbot").join("myapp").join("main");
    std::fs::create_dir_all(&specific).unwrap();
    std::fs::write(specific.join("kustomization.yaml"), "resources: []\n").unwrap();
    world.push("web", "main", NEXT_SHA);
    world.converge().await;

    let last = world.tools.applied().pop().unwrap();
    assert_eq!(last.manifest, specific.join(".devbot.output.resources.yaml"));
    assert!(last.content.contains(&format!("commit: {NEXT_SHA}")));
}

#[tokio::test]
async fn test_missing_kustomization_fails_baking() {
    let world = world_with_main().await;
    world.converge().await;
    std::fs::remove_dir_all(clone_path(&world).join(".devbot")).unwrap();

    world.push("web", "main", NEXT_SHA);
    until(&world, |w| {
        main_deployment(w)
            .status
            .unwrap()
            .conditions
            .has_reason(StaleReason::BakingFailed)
    })
    .await;

    let status = main_deployment(&world).status.unwrap();
    assert_eq!(status.last_applied_revision, SHA);
    assert_eq!(world.tools.count(Tool::Apply), 1);
}

#[tokio::test]
async fn test_entry_path_of_repository() {
    let world = world_with_main().await;
    world
        .store
        .edit::<Application>(&world.application("myapp").key(), |a| {
            a.spec.repositories[0].path = Some("/deploy/".into())
        });
    world.converge().await;
    let path = clone_path(&world);
    assert!(main_deployment(&world)
        .status
        .unwrap()
        .conditions
        .has_reason(StaleReason::BakingFailed));

    let dir = path.join("deploy").join(".devbot");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("kustomization.yaml"), "resources: []\n").unwrap();
    world.converge().await;

    let last = world.tools.applied().pop().unwrap();
    assert!(last.manifest.starts_with(path.join("deploy")));
}

// ============================================================================
// Apply
// ============================================================================

#[tokio::test]
async fn test_apply_failure_keeps_last_applied_revision() {
    let world = world_with_main().await;
    world.converge().await;

    world.push("web", "main", NEXT_SHA);
    world.tools.fail_next(Tool::Apply, "admission webhook denied");
    until(&world, |w| w.tools.count(Tool::Apply) >= 2).await;

    let status = main_deployment(&world).status.unwrap();
    assert!(status.conditions.has_reason(StaleReason::ApplyFailed));
    assert_eq!(status.last_applied_revision, SHA);
    assert_eq!(status.last_attempted_revision, NEXT_SHA);

    world.converge().await;

    let status = main_deployment(&world).status.unwrap();
    assert_eq!(status.last_applied_revision, NEXT_SHA);
    assert!(!status.conditions.is_set::<StaleReason>());
}

#[tokio::test]
async fn test_apply_impersonates_service_account() {
    let world = world_with_main().await;
    world
        .store
        .edit::<Application>(&world.application("myapp").key(), |a| {
            a.spec.service_account_name = "deployer".into()
        });

    world.converge().await;

    let applied = world.tools.applied();
    assert_eq!(applied.len(), 1);
    assert_eq!(
        applied[0].options.impersonate.as_deref(),
        Some("system:serviceaccount:team:deployer")
    );
    assert_eq!(applied[0].options.mode, ApplyMode::DryRun);
}

#[tokio::test]
async fn test_manifest_is_written_next_to_kustomization() {
    let world = world_with_main().await;
    world.converge().await;

    let output = clone_path(&world).join(".devbot").join(".devbot.output.resources.yaml");
    let content = std::fs::read_to_string(output).unwrap();
    assert!(content.contains("name: myapp-main"));
    assert!(!content.contains("${"));
    assert!(Path::new(&world.tools.applied()[0].manifest).exists());
}
