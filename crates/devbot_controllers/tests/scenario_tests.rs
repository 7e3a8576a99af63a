//! End-to-End-Tests: alle fünf Controller gegen den In-Memory-Store.

use devbot_api::conditions::{StaleReason, UnauthenticatedReason};
use devbot_api::{ManagedObject, MissingBranchStrategy};
use devbot_controllers::test_utils::{Tool, World, NAMESPACE, SECRET_KEY, SECRET_NAME, TOKEN};

const MAIN_SHA: &str = "1111111111111111111111111111111111111111";
const FEAT1_SHA: &str = "2222222222222222222222222222222222222222";
const FEAT2_SHA: &str = "3333333333333333333333333333333333333333";
const PUSHED_SHA: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

/// Ein Repository mit `main`, `feat1`, `feat2` und eine Application darauf.
async fn single_repository(strategy: MissingBranchStrategy) -> World {
    let world = World::new();
    world.add_repository("web", "main", &[("main", MAIN_SHA), ("feat1", FEAT1_SHA), ("feat2", FEAT2_SHA)]);
    world.add_application("myapp", &[("web", strategy)]);
    world.converge().await;
    world
}

fn branches<V>(map: &std::collections::BTreeMap<String, V>) -> Vec<&str> {
    map.keys().map(String::as_str).collect()
}

// ============================================================================
// Neue Application, ein Repository, drei Branches
// ============================================================================

#[tokio::test]
async fn test_one_environment_per_branch() {
    let world = single_repository(MissingBranchStrategy::UseDefaultBranch).await;

    assert_eq!(branches(&world.refs_of("web")), ["feat1", "feat2", "main"]);

    let envs = world.environments_of("myapp");
    assert_eq!(branches(&envs), ["feat1", "feat2", "main"]);
    for (branch, env) in &envs {
        assert_eq!(env.sources().len(), 1, "environment {branch}");
        let deployments = world.deployments_of(env);
        assert_eq!(deployments.len(), 1);
        let deployment = &deployments["web"];
        assert_eq!(env.sources()[0].deployment.as_ref().unwrap().name, deployment.metadata.name.clone().unwrap());
        assert_eq!(&deployment.spec.branch, branch);
    }
}

#[tokio::test]
async fn test_converged_objects_are_valid_and_current() {
    let world = single_repository(MissingBranchStrategy::UseDefaultBranch).await;

    let repo = world.repository("web");
    let status = repo.status.as_ref().unwrap();
    assert_eq!(status.default_branch, "main");
    assert_eq!(status.resolved_name, "acme/web");
    assert!(status.valid && status.current, "{:?}", status.conditions);

    for r in world.refs_of("web").values() {
        let status = r.status.as_ref().unwrap();
        assert!(status.valid && status.current, "{:?}", status.conditions);
        assert_eq!(status.repository_owner, "acme");
    }

    let deployment = world.deployment("myapp", "feat1", "web");
    let status = deployment.status.as_ref().unwrap();
    assert!(status.current, "{:?}", status.conditions);
    assert_eq!(status.last_applied_revision, FEAT1_SHA);
    assert_eq!(status.resolved_repository, format!("{NAMESPACE}/web"));
    assert!(status.clone_path.starts_with(world.workspace.path().to_str().unwrap()));
}

#[tokio::test]
async fn test_rendered_manifest_carries_variables() {
    let world = single_repository(MissingBranchStrategy::UseDefaultBranch).await;

    let applied = world.tools.applied();
    assert_eq!(applied.len(), 3);
    let feat1 = applied
        .iter()
        .find(|a| a.content.contains("branch: feat1"))
        .unwrap();
    assert!(feat1.content.contains("name: myapp-feat1"));
    assert!(feat1.content.contains(&format!("commit: {FEAT1_SHA}")));
    assert!(feat1.manifest.ends_with(".devbot/.devbot.output.resources.yaml"));
    assert_eq!(feat1.options.impersonate, None);
}

#[tokio::test]
async fn test_quiescent_world_writes_nothing() {
    let world = single_repository(MissingBranchStrategy::UseDefaultBranch).await;
    let writes = world.store.writes();
    let applies = world.tools.count(Tool::Apply);

    let errors = world.reconcile_all().await;
    world.reconcile_all().await;

    assert!(errors.is_empty(), "{errors:?}");
    assert_eq!(world.store.writes(), writes);
    assert_eq!(world.tools.count(Tool::Apply), applies);
}

// ============================================================================
// Mehrere Repositories, fehlende Branches
// ============================================================================

async fn two_repositories(r2_strategy: MissingBranchStrategy) -> World {
    let world = World::new();
    world.add_repository("r1", "main", &[("main", MAIN_SHA), ("b1", FEAT1_SHA)]);
    world.add_repository("r2", "main", &[("main", MAIN_SHA), ("b2", FEAT2_SHA)]);
    world.add_application(
        "myapp",
        &[("r1", MissingBranchStrategy::UseDefaultBranch), ("r2", r2_strategy)],
    );
    world.converge().await;
    world
}

#[tokio::test]
async fn test_missing_branch_falls_back_to_default_branch() {
    let world = two_repositories(MissingBranchStrategy::UseDefaultBranch).await;

    let envs = world.environments_of("myapp");
    assert_eq!(branches(&envs), ["b1", "b2", "main"]);

    let b1 = world.deployments_of(&envs["b1"]);
    assert_eq!(b1["r1"].spec.branch, "b1");
    assert_eq!(b1["r2"].spec.branch, "main");

    let b2 = world.deployments_of(&envs["b2"]);
    assert_eq!(b2["r2"].spec.branch, "b2");
    assert_eq!(b2["r1"].spec.branch, "main");

    let main = world.deployments_of(&envs["main"]);
    assert_eq!(main.len(), 2);
}

#[tokio::test]
async fn test_missing_branch_ignored() {
    let world = two_repositories(MissingBranchStrategy::Ignore).await;

    let envs = world.environments_of("myapp");
    let b1 = &envs["b1"];
    let deployments = world.deployments_of(b1);
    assert_eq!(branches(&deployments), ["r1"]);

    let r2 = b1
        .sources()
        .iter()
        .find(|s| s.repository.name == "r2")
        .unwrap();
    assert_eq!(r2.deployment, None);
    assert!(b1.status.as_ref().unwrap().current);
}

// ============================================================================
// Branch gelöscht
// ============================================================================

#[tokio::test]
async fn test_deleted_branch_with_ignore_removes_deployment() {
    let world = single_repository(MissingBranchStrategy::Ignore).await;
    let clone_path = world.deployment("myapp", "feat1", "web").status.unwrap().clone_path;

    world.delete_branch("web", "feat1");
    world.converge().await;

    assert_eq!(branches(&world.refs_of("web")), ["feat2", "main"]);
    let envs = world.environments_of("myapp");
    let feat1 = &envs["feat1"];
    assert!(world.deployments_of(feat1).is_empty());
    assert_eq!(feat1.sources().len(), 1);
    assert_eq!(feat1.sources()[0].deployment, None);
    assert!(!std::path::Path::new(&clone_path).exists());
}

#[tokio::test]
async fn test_deleted_branch_with_default_strategy_retargets_deployment() {
    let world = single_repository(MissingBranchStrategy::UseDefaultBranch).await;
    let before = world.deployment("myapp", "feat1", "web");

    world.delete_branch("web", "feat1");
    world.converge().await;

    let after = world.deployment("myapp", "feat1", "web");
    assert_eq!(after.metadata.name, before.metadata.name);
    assert_eq!(after.spec.branch, "main");
    let status = after.status.unwrap();
    assert_eq!(status.branch, "main");
    assert_eq!(status.last_applied_revision, MAIN_SHA);
    assert!(status.current, "{:?}", status.conditions);
}

// ============================================================================
// Token-Rotation
// ============================================================================

#[tokio::test]
async fn test_auth_rotation_restores_authentication() {
    let world = single_repository(MissingBranchStrategy::UseDefaultBranch).await;
    let refs = world.refs_of("web");

    world.github.revoke_token(TOKEN);
    world.converge().await;
    let repo = world.repository("web");
    assert!(repo
        .status
        .as_ref()
        .unwrap()
        .conditions
        .has_reason(UnauthenticatedReason::TokenValidationFailed));

    world.github.allow_token("ghp_rotated");
    world.store.put_secret(NAMESPACE, SECRET_NAME, SECRET_KEY, "ghp_rotated");
    world.converge().await;

    let repo = world.repository("web");
    let conditions = &repo.status.as_ref().unwrap().conditions;
    assert!(!conditions.is_set::<UnauthenticatedReason>(), "{conditions:?}");
    let names = |refs: &std::collections::BTreeMap<String, devbot_api::Ref>| {
        refs.values().map(|r| r.metadata.name.clone()).collect::<Vec<_>>()
    };
    assert_eq!(names(&world.refs_of("web")), names(&refs));
    assert_eq!(world.environments_of("myapp").len(), 3);
}

// ============================================================================
// Push
// ============================================================================

#[tokio::test]
async fn test_push_is_deployed() {
    let world = single_repository(MissingBranchStrategy::UseDefaultBranch).await;
    let main_ref = world.refs_of("web").remove("main").unwrap();

    world.push("web", "main", PUSHED_SHA);
    world.refs.reconcile(&main_ref.key()).await.unwrap();

    let r: devbot_api::Ref = world.store.get_now(&main_ref.key()).unwrap();
    let status = r.status.unwrap();
    assert_eq!(status.commit_sha, PUSHED_SHA);
    assert!(status.conditions.has_reason(StaleReason::CommitShaOutOfSync));

    world.converge().await;

    let r: devbot_api::Ref = world.store.get_now(&main_ref.key()).unwrap();
    assert!(r.status.unwrap().current);
    let deployment = world.deployment("myapp", "main", "web");
    let status = deployment.status.unwrap();
    assert_eq!(status.last_applied_revision, PUSHED_SHA);
    assert_eq!(status.last_attempted_revision, PUSHED_SHA);
    assert!(world
        .tools
        .applied()
        .iter()
        .any(|a| a.content.contains(&format!("commit: {PUSHED_SHA}"))));
}

#[tokio::test]
async fn test_same_head_is_applied_once() {
    let world = single_repository(MissingBranchStrategy::UseDefaultBranch).await;
    assert_eq!(world.tools.count(Tool::Apply), 3);

    world.push("web", "feat2", PUSHED_SHA);
    world.converge().await;
    world.converge().await;

    assert_eq!(world.tools.count(Tool::Apply), 4);
}
