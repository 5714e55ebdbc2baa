//! Tether demo — a goals list and a user profile kept in sync with an
//! in-memory document store.
//!
//! `RUST_LOG` controls log output (default `info`). Set `TETHER_ANONYMOUS=1`
//! to start every session as an anonymous user that signs up later by
//! linking an email credential.

use log::info;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use tether_session::{
    CurrentUser, MemoryAuth, ProfileConfig, ProfileFactory, ProfileSession, SessionConfig,
};
use tether_sync::{
    ChangeKind, CollectionRef, CollectionSync, Identifiable, MemoryStore, MergeWriteThrough,
    SyncConfig,
};

/// A goal, listed by priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Goal {
    title: String,
    priority: u32,
    #[serde(skip)]
    id: Option<String>,
}

impl Goal {
    fn new(id: &str, title: &str, priority: u32) -> Self {
        Self {
            title: title.to_string(),
            priority,
            id: Some(id.to_string()),
        }
    }
}

impl Identifiable for Goal {
    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn set_id(&mut self, id: String) {
        self.id = Some(id);
    }
}

impl PartialEq for Goal {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl Eq for Goal {}

impl PartialOrd for Goal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Goal {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Profile {
    display_name: String,
    sessions: u32,
}

struct DemoProfiles;

impl ProfileFactory<Profile> for DemoProfiles {
    fn default_profile(&self, _user: &CurrentUser) -> Profile {
        Profile {
            display_name: "guest".to_string(),
            sessions: 0,
        }
    }

    fn profile_for(&self, user: &CurrentUser) -> Profile {
        Profile {
            display_name: user.email.clone().unwrap_or_default(),
            sessions: 0,
        }
    }

    fn update_profile(&self, profile: &mut Profile, _user: &CurrentUser) {
        profile.sessions += 1;
    }

    fn on_profile_change(&self, profile: &Profile) {
        info!("profile now {profile:?}");
    }
}

const PUSH_TIMEOUT: Duration = Duration::from_secs(2);

async fn goals_demo(store: Arc<MemoryStore>) -> Result<(), Box<dyn Error>> {
    let goals: CollectionSync<Goal> =
        CollectionSync::with_strategy(store, SyncConfig::default(), Arc::new(MergeWriteThrough));
    goals.attach(CollectionRef::new("goals"), None);

    goals.on_event(|kind: ChangeKind, goal: &Goal| {
        info!("{kind:?}: {} (priority {})", goal.title, goal.priority);
    });
    let (tx, mut batches) = mpsc::unbounded_channel();
    goals.on_batch(move |items: &[Goal]| {
        let _ = tx.send(items.len());
    });
    goals.start().await?;

    for goal in [
        Goal::new("run", "Run a 10k", 3),
        Goal::new("read", "Read 12 books", 1),
        Goal::new("code", "Ship the sync engine", 2),
    ] {
        goals.insert(&goal).await?;
        timeout(PUSH_TIMEOUT, batches.recv()).await?;
    }
    let titles: Vec<String> = goals.items().into_iter().map(|g| g.title).collect();
    info!("goals in order: {titles:?}");

    // reprioritize: the cache re-sorts when the store pushes the change back
    goals.insert(&Goal::new("read", "Read 12 books", 9)).await?;
    timeout(PUSH_TIMEOUT, batches.recv()).await?;
    info!("after reprioritizing: {:?}", goals.items().iter().map(|g| &g.title).collect::<Vec<_>>());

    goals.commit_all().await?;
    goals.remove_many(&[0, 1]).await?;
    goals.stop();
    info!("goals demo done");
    Ok(())
}

async fn wait_for_profile(profiles: &ProfileSession<Profile>) -> Result<(), Box<dyn Error>> {
    let mut ready = profiles.subscribe();
    timeout(PUSH_TIMEOUT, ready.wait_for(|s| s.is_ready())).await??;
    Ok(())
}

async fn profile_demo(
    store: Arc<MemoryStore>,
    anonymous: bool,
) -> Result<(), Box<dyn Error>> {
    let auth = Arc::new(MemoryAuth::new());
    let config = ProfileConfig {
        session: SessionConfig {
            anonymous_fallback: anonymous,
        },
        ..ProfileConfig::default()
    };
    let profiles: ProfileSession<Profile> =
        ProfileSession::new(auth, store, Arc::new(DemoProfiles), config);
    profiles.start();

    if anonymous {
        wait_for_profile(&profiles).await?;
        info!("anonymous profile ready: {:?}", profiles.profile());
    }

    profiles.signup("ada@example.com", "correct-horse").await?;
    info!(
        "signed up as {:?}, profile {:?}",
        profiles.session().email(),
        profiles.profile()
    );

    profiles.signout()?;
    if anonymous {
        // the fallback signs a fresh anonymous user in right away
        wait_for_profile(&profiles).await?;
    }
    let user = profiles.login("ada@example.com", "correct-horse").await?;
    info!("logged back in as {}, profile {:?}", user.uid, profiles.profile());

    profiles.signout()?;
    profiles.stop();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let anonymous = std::env::var("TETHER_ANONYMOUS")
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);
    info!("Starting tether demo (anonymous sessions: {anonymous})");

    let store = Arc::new(MemoryStore::new());
    goals_demo(Arc::clone(&store)).await?;
    profile_demo(Arc::clone(&store), anonymous).await?;

    let stats = store.stats();
    info!(
        "store handled {} writes, {} deletes, {} pushes",
        stats.writes, stats.deletes, stats.pushes_sent
    );
    Ok(())
}
