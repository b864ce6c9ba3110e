//! Scenario tests for the declarative reconciler

#[cfg(test)]
mod tests {
    use crate::mock::{config_maps_yaml, test_manifest, MockCluster, MockInstanceClient, MockRenderer};
    use crate::reconciler::{Outcome, Reconciler, ReconcilerOptions};
    use crate::render::RendererRegistry;
    use crate::status::{
        installation_condition, is_condition_true, resources_condition, set_condition,
        CONDITION_TYPE_INSTALLATION, CONDITION_TYPE_RESOURCES,
    };
    use crds::{
        ConditionStatus, Manifest, ManifestStatus, RenderMode, Resource, State, MANIFEST_FINALIZER,
        SKIP_RECONCILIATION_LABEL,
    };
    use std::collections::BTreeSet;
    use std::sync::Arc;

    const DEPLOYMENT_ROLLING: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: slow\nspec:\n  replicas: 1\n  selector: {}\n  template: {}\nstatus:\n  availableReplicas: 0\n";

    struct Harness {
        instances: Arc<MockInstanceClient>,
        cluster: Arc<MockCluster>,
        renderer: MockRenderer,
        reconciler: Reconciler,
    }

    impl Harness {
        fn new(text: &str) -> Self {
            let instances = Arc::new(MockInstanceClient::new());
            let cluster = Arc::new(MockCluster::new());
            let renderer = MockRenderer::new(text);
            let registry = RendererRegistry::new(".").with_factory(RenderMode::Chart, Arc::new(renderer.clone()));
            let reconciler = Reconciler::new(
                instances.clone(),
                cluster.clone(),
                Arc::new(registry),
                ReconcilerOptions::default(),
            );
            Self {
                instances,
                cluster,
                renderer,
                reconciler,
            }
        }

        async fn pass(&self, name: &str) -> Outcome {
            self.reconciler.reconcile("default", name).await.unwrap()
        }

        /// Runs passes until one asks for something other than an immediate requeue.
        async fn settle(&self, name: &str) -> Outcome {
            for _ in 0..10 {
                let outcome = self.pass(name).await;
                if outcome != Outcome::Requeue {
                    return outcome;
                }
            }
            panic!("{name} did not settle");
        }

        fn status(&self, name: &str) -> ManifestStatus {
            self.instances.manifest("default", name).unwrap().status_or_default()
        }
    }

    fn config_map(name: &str) -> Resource {
        Resource {
            group: String::new(),
            version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            name: name.to_string(),
            namespace: "default".to_string(),
        }
    }

    /// Instance that already reached Ready with `synced` applied.
    fn established(name: &str, synced: &[&str]) -> Manifest {
        let mut obj = test_manifest(name);
        obj.metadata.finalizers = Some(vec![MANIFEST_FINALIZER.to_string()]);
        let mut status = ManifestStatus::default().with_state(State::Ready);
        for mut condition in [resources_condition(Some(1)), installation_condition(Some(1))] {
            condition.status = ConditionStatus::True;
            set_condition(&mut status.conditions, condition);
        }
        status.synced = synced.iter().map(|n| config_map(n)).collect();
        status.observed_generation = Some(1);
        obj.status = Some(status);
        obj
    }

    fn synced_names(status: &ManifestStatus) -> Vec<String> {
        status.synced.iter().map(|r| r.name.clone()).collect()
    }

    #[tokio::test]
    async fn test_fresh_instance_installs_three_objects() {
        let h = Harness::new(&config_maps_yaml(&["a", "b", "c"]));
        h.instances.insert(test_manifest("m"));

        assert_eq!(h.pass("m").await, Outcome::Requeue);
        assert_eq!(h.status("m").state, State::Processing);
        assert_eq!(h.cluster.object_count(), 0, "first pass only writes the status");

        assert_eq!(h.pass("m").await, Outcome::Requeue);
        assert!(h.instances.manifest("default", "m").unwrap().has_finalizer(MANIFEST_FINALIZER));

        let outcome = h.settle("m").await;
        assert_eq!(outcome, Outcome::RequeueAfter(h.reconciler.options().requeue.success));

        let status = h.status("m");
        assert_eq!(status.state, State::Ready);
        assert_eq!(synced_names(&status), vec!["a", "b", "c"]);
        assert!(is_condition_true(&status.conditions, CONDITION_TYPE_RESOURCES));
        assert!(is_condition_true(&status.conditions, CONDITION_TYPE_INSTALLATION));
        assert_eq!(status.observed_generation, Some(1));

        let applied: BTreeSet<_> = h.cluster.applied_names().into_iter().collect();
        assert_eq!(applied, BTreeSet::from(["a".to_string(), "b".to_string(), "c".to_string()]));
        assert!(h.cluster.deleted_names().is_empty());
        assert!(h.instances.event_reasons().contains(&"Ready".to_string()));
    }

    #[tokio::test]
    async fn test_shrinking_render_prunes_the_difference() {
        let h = Harness::new(&config_maps_yaml(&["c", "d", "e"]));
        let mut obj = established("m", &["a", "b", "c", "d", "e"]);
        obj.metadata.generation = Some(2);
        h.instances.insert(obj);
        h.cluster
            .insert_all(&h.cluster.infos_from_yaml(&config_maps_yaml(&["a", "b", "c", "d", "e"])).await);

        h.settle("m").await;

        assert_eq!(h.cluster.deleted_names(), vec!["a", "b"]);
        let applied: BTreeSet<_> = h.cluster.applied_names().into_iter().collect();
        assert_eq!(applied, BTreeSet::from(["c".to_string(), "d".to_string(), "e".to_string()]));

        let status = h.status("m");
        assert_eq!(status.state, State::Ready);
        assert_eq!(synced_names(&status), vec!["c", "d", "e"]);
        assert_eq!(status.observed_generation, Some(2));
        assert!(!h.cluster.contains("ConfigMap", "default", "a"));
    }

    #[tokio::test]
    async fn test_changed_generation_reenters_processing_before_work() {
        let h = Harness::new(&config_maps_yaml(&["a", "b"]));
        let mut obj = established("m", &["a"]);
        obj.metadata.generation = Some(2);
        h.instances.insert(obj);

        assert_eq!(h.pass("m").await, Outcome::Requeue);
        let writes = h.instances.status_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].state, State::Processing);
        assert_eq!(writes[0].observed_generation, Some(2));
        assert!(h.cluster.applied_names().is_empty(), "nothing is applied before the status write");

        h.settle("m").await;
        assert_eq!(h.status("m").state, State::Ready);
        assert_eq!(synced_names(&h.status("m")), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_deletion_of_unobserved_instance_starts_with_deleting() {
        let h = Harness::new(&config_maps_yaml(&["a"]));
        let mut obj = test_manifest("m");
        obj.metadata.finalizers = Some(vec![MANIFEST_FINALIZER.to_string()]);
        h.instances.insert(obj);
        h.instances.mark_deleted("default", "m");

        assert_eq!(h.pass("m").await, Outcome::Requeue);
        let writes = h.instances.status_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].state, State::Deleting);
        assert_eq!(h.cluster.object_count(), 0);
        assert!(h.cluster.applied_names().is_empty());

        assert_eq!(h.settle("m").await, Outcome::Done);
        assert!(h.instances.manifest("default", "m").is_none());
        assert!(h.cluster.applied_names().is_empty());
    }

    #[tokio::test]
    async fn test_new_identities_are_applied_and_absent_ones_pruned() {
        let h = Harness::new(&config_maps_yaml(&["d", "x", "y"]));
        let mut obj = established("m", &["a", "b", "c", "d", "e"]);
        obj.metadata.generation = Some(2);
        h.instances.insert(obj);

        h.settle("m").await;

        assert_eq!(h.cluster.deleted_names(), vec!["a", "b", "c", "e"]);
        assert_eq!(synced_names(&h.status("m")), vec!["d", "x", "y"]);
        assert!(h.cluster.contains("ConfigMap", "default", "x"));
    }

    #[tokio::test]
    async fn test_deletion_waits_for_pending_objects_then_releases() {
        let names = ["a", "b", "c", "d", "e"];
        let h = Harness::new("");
        h.instances.insert(established("m", &names));
        h.instances.mark_deleted("default", "m");
        h.cluster.insert_all(&h.cluster.infos_from_yaml(&config_maps_yaml(&names)).await);
        h.cluster.block_deletion("e");

        assert_eq!(h.pass("m").await, Outcome::Requeue);
        assert_eq!(h.status("m").state, State::Deleting);
        assert_eq!(h.cluster.object_count(), 5, "status correction comes first");

        for _ in 0..2 {
            assert_eq!(h.pass("m").await, Outcome::Requeue);
            let obj = h.instances.manifest("default", "m").unwrap();
            assert!(obj.has_finalizer(MANIFEST_FINALIZER));
            assert_eq!(obj.status_or_default().state, State::Deleting);
        }
        assert_eq!(h.cluster.object_count(), 1);
        assert!(h.cluster.contains("ConfigMap", "default", "e"));

        h.cluster.release("e");
        assert_eq!(h.pass("m").await, Outcome::Done);
        assert!(h.instances.manifest("default", "m").is_none());
        assert_eq!(h.cluster.object_count(), 0);
        assert!(h.cluster.applied_names().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_finalizer_keeps_instance_deleting() {
        let h = Harness::new("");
        let mut obj = established("m", &[]);
        obj.metadata.finalizers = Some(vec!["foreign.io/keep".to_string()]);
        obj.status = Some(obj.status_or_default().with_state(State::Deleting));
        h.instances.insert(obj);
        h.instances.mark_deleted("default", "m");

        assert_eq!(h.pass("m").await, Outcome::Requeue);
        let status = h.status("m");
        assert_eq!(status.state, State::Deleting);
        assert!(status.last_operation.unwrap().operation.contains("foreign.io/keep"));
    }

    #[tokio::test]
    async fn test_empty_render_reaches_ready() {
        let h = Harness::new("");
        h.instances.insert(test_manifest("m"));

        h.settle("m").await;

        let status = h.status("m");
        assert_eq!(status.state, State::Ready);
        assert!(status.synced.is_empty());
        assert!(is_condition_true(&status.conditions, CONDITION_TYPE_RESOURCES));
        assert!(is_condition_true(&status.conditions, CONDITION_TYPE_INSTALLATION));
        assert_eq!(h.cluster.object_count(), 0);
    }

    #[tokio::test]
    async fn test_unready_resources_keep_processing() {
        let h = Harness::new(DEPLOYMENT_ROLLING);
        h.instances.insert(established("m", &[]));

        for _ in 0..3 {
            assert_eq!(h.pass("m").await, Outcome::Requeue);
        }
        let status = h.status("m");
        assert_eq!(status.state, State::Processing);
        assert!(!is_condition_true(&status.conditions, CONDITION_TYPE_INSTALLATION));
        assert_eq!(
            status.last_operation.unwrap().operation,
            "waiting for resources to become ready"
        );
        assert!(h.instances.event_reasons().contains(&"ResourceReadyCheck".to_string()));
    }

    #[tokio::test]
    async fn test_apply_failure_moves_to_error_without_recording() {
        let h = Harness::new(&config_maps_yaml(&["a", "b"]));
        h.instances.insert(established("m", &["a"]));
        h.cluster.fail_apply("b");

        assert_eq!(h.pass("m").await, Outcome::Requeue);

        let status = h.status("m");
        assert_eq!(status.state, State::Error);
        assert_eq!(synced_names(&status), vec!["a"]);
        assert!(h.instances.event_reasons().contains(&"ServerSideApply".to_string()));
    }

    #[tokio::test]
    async fn test_render_failure_moves_to_error() {
        let h = Harness::new("");
        h.renderer.fail_render(true);
        h.instances.insert(established("m", &[]));

        assert_eq!(h.pass("m").await, Outcome::Requeue);
        assert_eq!(h.status("m").state, State::Error);
        assert!(h.instances.event_reasons().contains(&"Render".to_string()));

        h.renderer.fail_render(false);
        h.settle("m").await;
        assert_eq!(h.status("m").state, State::Ready);
    }

    #[tokio::test]
    async fn test_unresolvable_spec_moves_to_error() {
        let h = Harness::new("");
        let mut obj = established("m", &[]);
        obj.spec.installs.clear();
        h.instances.insert(obj);

        assert_eq!(h.pass("m").await, Outcome::Requeue);
        assert_eq!(h.status("m").state, State::Error);
        assert_eq!(h.instances.event_reasons(), vec!["Spec".to_string()]);
    }

    #[tokio::test]
    async fn test_status_conflict_requeues_without_error() {
        let h = Harness::new("");
        h.instances.insert(test_manifest("m"));
        h.instances.conflict_on_next_status();

        assert_eq!(h.pass("m").await, Outcome::Requeue);
        assert!(h.instances.manifest("default", "m").unwrap().status.is_none());

        assert_eq!(h.pass("m").await, Outcome::Requeue);
        assert_eq!(h.status("m").state, State::Processing);
    }

    #[tokio::test]
    async fn test_skip_label_and_missing_instance_are_left_alone() {
        let h = Harness::new(&config_maps_yaml(&["a"]));
        let mut obj = test_manifest("m");
        obj.metadata.labels = Some([(SKIP_RECONCILIATION_LABEL.to_string(), "true".to_string())].into());
        h.instances.insert(obj);

        assert_eq!(h.pass("m").await, Outcome::Done);
        assert_eq!(h.pass("missing").await, Outcome::Done);
        assert!(h.instances.status_writes().is_empty());
        assert_eq!(h.cluster.object_count(), 0);
    }

    #[tokio::test]
    async fn test_stable_instance_keeps_reapplying() {
        let h = Harness::new(&config_maps_yaml(&["a"]));
        h.instances.insert(established("m", &["a"]));

        let outcome = h.pass("m").await;
        assert_eq!(outcome, Outcome::RequeueAfter(h.reconciler.options().requeue.success));
        assert!(h.instances.status_writes().is_empty());
        assert_eq!(h.cluster.applied_names(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_remote_copy_is_synced_when_enabled() {
        let h = Harness::new(&config_maps_yaml(&["a"]));
        let mut obj = established("m", &["a"]);
        obj.spec.sync.enabled = true;
        obj.spec.sync.namespace = "kyma-system".to_string();
        h.instances.insert(obj);

        h.settle("m").await;
        assert!(h.cluster.contains("Manifest", "kyma-system", "m"));
        assert_eq!(h.cluster.status_of("Manifest", "kyma-system", "m").unwrap()["state"], "Ready");
    }

    #[tokio::test]
    async fn test_local_sync_without_namespace_leaves_instance_alone() {
        let h = Harness::new(&config_maps_yaml(&["a"]));
        let mut obj = established("m", &["a"]);
        obj.spec.sync.enabled = true;
        h.instances.insert(obj);

        h.settle("m").await;
        assert_eq!(h.status("m").state, State::Ready);
        assert!(!h.cluster.contains("Manifest", "default", "m"));

        h.instances.mark_deleted("default", "m");
        assert_eq!(h.settle("m").await, Outcome::Done);
        assert!(h.instances.manifest("default", "m").is_none());
        assert!(!h.cluster.contains("Manifest", "default", "m"));
    }
}
