#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{TimeDelta, Utc};
use fleet_controller::controller::lifecycle::MemoryReleases;
use fleet_controller::model::{
    conditions, Condition, ConditionStatus, Fleet, Instance, InstanceStatus, InstanceTemplate,
    ObjectMeta, Phase, FLEET_NAME_LABEL, REVISION_LABEL,
};
use fleet_controller::platform::memory::{FleetManifest, MemoryPlatform};
use fleet_controller::FleetReconciler;
use fleet_id::InstanceUid;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,fleet_controller=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn manifest(name: &str, replicas: u32, image: &str) -> FleetManifest {
    FleetManifest {
        namespace: "default".to_string(),
        name: name.to_string(),
        replicas,
        template: InstanceTemplate {
            labels: Default::default(),
            spec: serde_json::json!({ "image": image }),
        },
        labels: Default::default(),
    }
}

pub struct Harness {
    pub platform: Arc<MemoryPlatform>,
    pub releases: Arc<MemoryReleases>,
    pub reconciler: FleetReconciler,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let platform = Arc::new(MemoryPlatform::new());
        let releases = Arc::new(MemoryReleases::new());
        let reconciler = FleetReconciler::new(platform.clone(), releases.clone());
        Self {
            platform,
            releases,
            reconciler,
        }
    }

    /// Apply a fleet and run the first pass, which only adds the finalizer.
    pub async fn active_fleet(&self, replicas: u32) -> Fleet {
        let fleet = self.platform.apply_fleet(manifest("web", replicas, "app:v2")).await;
        self.releases.install(fleet.key()).await;
        self.reconciler.reconcile(&fleet.key()).await.unwrap();
        self.platform.clear_calls().await;
        self.platform.fleet(&fleet.key()).await.unwrap()
    }

    pub async fn fleet(&self, fleet: &Fleet) -> Option<Fleet> {
        self.platform.fleet(&fleet.key()).await
    }

    pub async fn instance_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .platform
            .instances("default")
            .await
            .into_iter()
            .map(|i| i.metadata.name)
            .collect();
        names.sort();
        names
    }
}

/// Builds instances owned by a fleet.
pub struct InstanceBuilder {
    instance: Instance,
}

impl InstanceBuilder {
    /// Pending, at the fleet's current revision, created just now.
    pub fn new(fleet: &Fleet, name: &str) -> Self {
        let mut metadata = ObjectMeta::new(&fleet.metadata.namespace, name, InstanceUid::new());
        metadata
            .labels
            .insert(FLEET_NAME_LABEL.to_string(), fleet.metadata.name.clone());
        metadata.labels.insert(
            REVISION_LABEL.to_string(),
            fleet.current_revision().to_string(),
        );
        metadata.owner_references.push(fleet.owner_reference());

        Self {
            instance: Instance {
                metadata,
                spec: fleet.spec.template.spec.clone(),
                status: InstanceStatus::default(),
            },
        }
    }

    pub fn revision(mut self, revision: &str) -> Self {
        self.instance
            .metadata
            .labels
            .insert(REVISION_LABEL.to_string(), revision.to_string());
        self
    }

    pub fn age(mut self, age: TimeDelta) -> Self {
        self.instance.metadata.creation_timestamp = Utc::now() - age;
        self
    }

    pub fn unschedulable(mut self) -> Self {
        self.instance.status.conditions.push(Condition::new(
            conditions::SCHEDULED,
            ConditionStatus::False,
            conditions::REASON_UNSCHEDULABLE,
            "0/3 nodes are available",
            self.instance.metadata.creation_timestamp,
        ));
        self
    }

    pub fn running(mut self, ready: bool) -> Self {
        let now = Utc::now();
        self.instance.status.phase = Phase::Running;
        self.instance.status.start_time = Some(now);
        self.instance.status.conditions = vec![
            Condition::new(conditions::SCHEDULED, ConditionStatus::True, "", "", now),
            Condition::new(
                conditions::READY,
                if ready { ConditionStatus::True } else { ConditionStatus::False },
                "",
                "",
                now,
            ),
        ];
        self
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.instance.status.phase = phase;
        self
    }

    pub fn build(self) -> Instance {
        self.instance
    }
}

/// Poll `check` until it holds, panicking after a few seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
