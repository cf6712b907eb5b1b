//! Seeds a store with users, posts and a burst of concurrent replies, then
//! checks that every reply counter adds up.
//!
//! Usage: `seed [posts] [replies]` (defaults 40 and 100).

use std::sync::Arc;

use anyhow::Context;
use configs::Settings;
use domains::{DomainError, Identifier, RequestContext, User};
use services::{ForumCore, Signup};
use tokio::task::JoinSet;
use tracing::{info, warn};

const NAMES: [&str; 4] = ["seed_aa", "seed_bb", "seed_cc", "seed_dd"];
const SEED_IP: &str = "127.0.0.1";
const SEED_PASSWORD: &str = "seed-password";

fn pick<T>(items: &[T]) -> &T {
    &items[rand::random::<u32>() as usize % items.len()]
}

async fn ensure_user(core: &ForumCore, name: &str) -> anyhow::Result<User> {
    let ctx = RequestContext { session_token: None, ip: SEED_IP.to_string() };
    let challenge = core.accounts.new_captcha(&ctx);
    let req = Signup {
        username: name.to_string(),
        email: format!("{name}@example.invalid"),
        password: SEED_PASSWORD.to_string(),
        ip: SEED_IP.to_string(),
        challenge_id: challenge.id,
        challenge_answer: challenge.text,
    };
    match core.accounts.signup(req).await {
        Ok((user, _)) => Ok(user),
        Err(DomainError::Conflict(_)) => core
            .get_user(name)
            .await?
            .with_context(|| format!("{name} exists but cannot be read")),
        Err(err) => Err(err).with_context(|| format!("signing up {name}")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("loading settings")?;
    bootstrap::init_tracing(&settings.log)?;

    let mut args = std::env::args().skip(1);
    let posts: usize = args.next().map(|s| s.parse()).transpose().context("posts must be a number")?.unwrap_or(40);
    let replies: usize = args.next().map(|s| s.parse()).transpose().context("replies must be a number")?.unwrap_or(100);

    let core = Arc::new(bootstrap::build_core(&settings).await?);

    let mut users = Vec::with_capacity(NAMES.len());
    for name in NAMES {
        users.push(ensure_user(&core, name).await?);
    }
    let users = Arc::new(users);

    let mut roots: Vec<Identifier> = Vec::with_capacity(posts);
    for i in 0..posts {
        let author = pick(users.as_slice());
        let id = core.threads.post(author, &format!("SEED {i} post #seed"), SEED_IP, i % 2 == 0).await?;
        roots.push(id);
    }
    let Some(first) = roots.first().cloned() else {
        info!("nothing to do");
        return Ok(());
    };
    info!(posts, "posts created");

    // Most replies pile onto the first post, the rest scatter.
    let roots = Arc::new(roots);
    let mut tasks = JoinSet::new();
    for i in 0..replies {
        let (core, users, roots, first) = (core.clone(), users.clone(), roots.clone(), first.clone());
        tasks.spawn(async move {
            let parent = if rand::random::<u8>() % 4 == 1 { pick(roots.as_slice()).clone() } else { first };
            let author = pick(users.as_slice());
            let reply = core.threads.post_reply(&parent, author, &format!("SEED {i} reply"), SEED_IP).await?;
            // A reply to the reply makes propagation cross more than one level.
            if i % 10 == 0 {
                core.threads.post_reply(&reply, author, &format!("SEED {i} nested"), SEED_IP).await?;
                info!(progress = i, "replies");
            }
            Ok::<_, DomainError>(())
        });
    }

    let mut failed = 0;
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined.context("reply task panicked")? {
            warn!(error = %err, "reply failed");
            failed += 1;
        }
    }

    let mut drift = 0;
    for root in roots.iter() {
        let report = core.reconciler.repair_thread(root).await?;
        drift += report.fixed.len();
    }
    let first_article = core.get_article(&first).await?.context("first post vanished")?;
    info!(
        replies,
        failed,
        drift,
        first_replies = first_article.replies,
        tagged = core.threads.tag_total("seed").await?,
        "seeding finished"
    );
    Ok(())
}
