use futures_util::future::join_all;
use log::info;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, timeout_at, Instant};

use super::{Config, LockArgs, Locker};

// Represents a structure of a granted lock.
#[derive(Debug)]
struct Granted {
    index: usize,
    lock_uid: String, // Locked if set with UID string, unlocked if empty
}

impl Granted {
    fn is_locked(&self) -> bool {
        is_locked(&self.lock_uid)
    }
}

pub(super) fn is_locked(uid: &str) -> bool {
    !uid.is_empty()
}

/// Number of grants a shared lock needs out of `n` lockers.
pub fn read_quorum(n: usize) -> usize {
    (n + 1) / 2
}

/// Number of grants an exclusive lock needs out of `n` lockers.
pub fn write_quorum(n: usize) -> usize {
    read_quorum(n) + 1
}

// Determines whether we have locked the required quorum of underlying locks or not.
fn quorum_met(locks: &[String], is_read_lock: bool) -> bool {
    let count = locks.iter().filter(|uid| is_locked(uid)).count();
    if is_read_lock {
        count >= read_quorum(locks.len())
    } else {
        count >= write_quorum(locks.len())
    }
}

// Tries to acquire the lock on all lockers of the snapshot concurrently.
//
// Returns the uid of every grant, one slot per locker, when the quorum was
// met. The decision is made by a detached task, so grants are released
// even if the returned future is dropped before it completes. Grants
// arriving after the decision are released as well.
pub(super) async fn lock(
    lockers: &[Locker],
    id: &str,
    source: &str,
    is_read_lock: bool,
    lock_names: &[String],
    config: &Config,
) -> Option<Vec<String>> {
    if lockers.is_empty() {
        return None;
    }

    let (tx, rx) = mpsc::channel(lockers.len());

    for (index, locker) in lockers.iter().enumerate() {
        // Broadcast lock request to all nodes
        let locker = match locker {
            Locker::Offline => {
                let _ = tx.try_send(Granted {
                    index,
                    lock_uid: String::new(),
                });
                continue;
            }
            Locker::Online(locker) => locker.clone(),
        };
        let tx = tx.clone();
        let args = LockArgs {
            uid: id.to_owned(),
            resources: lock_names.to_vec(),
            source: source.to_owned(),
        };
        let config = config.clone();
        tokio::spawn(async move {
            let mut g = Granted {
                index,
                lock_uid: String::new(),
            };

            let locked = if is_read_lock {
                locker.rlock(&args).await
            } else {
                locker.lock(&args).await
            };
            match locked {
                Ok(true) => g.lock_uid = args.uid.clone(),
                Ok(false) => {}
                Err(err) => {
                    if config.trace {
                        info!(
                            "dsync: Unable to call {} failed with {} for {:?} at {}",
                            if is_read_lock { "rlock" } else { "lock" },
                            err,
                            args,
                            locker
                        );
                    }
                }
            }
            if let Err(mpsc::error::SendError(g)) = tx.send(g).await {
                // Nobody is collecting grants anymore; hand this one back.
                if g.is_locked() {
                    send_release(
                        &Locker::Online(locker),
                        &g.lock_uid,
                        is_read_lock,
                        &args.resources,
                        &config,
                    )
                    .await;
                }
            }
        });
    }
    drop(tx);

    let (decided_tx, decided_rx) = oneshot::channel();
    tokio::spawn(collect(
        lockers.to_vec(),
        rx,
        decided_tx,
        is_read_lock,
        lock_names.to_vec(),
        config.clone(),
    ));
    decided_rx.await.unwrap_or(None)
}

// Collects the answers of one lock attempt and reports the decision.
async fn collect(
    lockers: Vec<Locker>,
    mut rx: mpsc::Receiver<Granted>,
    decided: oneshot::Sender<Option<Vec<String>>>,
    is_read_lock: bool,
    lock_names: Vec<String>,
    config: Config,
) {
    // Wait until we have either
    // a) received all lock responses
    // b) received too many 'non-'locks for quorum to be still possible
    // c) timed out
    let n = lockers.len();
    let tolerance = if is_read_lock {
        n - read_quorum(n)
    } else {
        n.saturating_sub(write_quorum(n))
    };
    let mut locks = vec![String::new(); n];
    let mut locks_failed = 0;
    // Combined timeout for the lock attempt.
    let deadline = Instant::now() + config.acquire_timeout;
    loop {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some(grant)) => {
                if grant.is_locked() {
                    // Mark that this node has acquired the lock
                    locks[grant.index] = grant.lock_uid;
                } else {
                    locks_failed += 1;
                    if locks_failed > tolerance {
                        // We know that we are not going to get the lock anymore,
                        // so exit out and release any locks that did get acquired
                        break;
                    }
                }
            }
            // Every locker answered.
            Ok(None) => break,
            // Captured timeout, locks as failed or took too long
            Err(_) => break,
        }
    }

    let decision = if quorum_met(&locks, is_read_lock) {
        Some(locks)
    } else {
        release_all(&lockers, &mut locks, is_read_lock, &lock_names, &config).await;
        None
    };
    if let Err(Some(locks)) = decided.send(decision) {
        // The caller is gone and will never record these grants.
        unlock(&lockers, &locks, is_read_lock, &lock_names, &config).await;
    }

    // Responses still in flight are too late: whatever they grant has to
    // be handed back, whether or not this attempt succeeded.
    while let Some(grant) = rx.recv().await {
        if grant.is_locked() {
            send_release(
                &lockers[grant.index],
                &grant.lock_uid,
                is_read_lock,
                &lock_names,
                &config,
            )
            .await;
        }
    }
}

// Releases every lock recorded in `locks` and clears the slots.
async fn release_all(
    lockers: &[Locker],
    locks: &mut [String],
    is_read_lock: bool,
    lock_names: &[String],
    config: &Config,
) {
    unlock(lockers, locks, is_read_lock, lock_names, config).await;
    for uid in locks.iter_mut() {
        uid.clear();
    }
}

// Sends a release to every locker that holds a grant in `locks`.
async fn unlock(
    lockers: &[Locker],
    locks: &[String],
    is_read_lock: bool,
    names: &[String],
    config: &Config,
) {
    let releases = lockers
        .iter()
        .zip(locks)
        .filter(|(_, uid)| is_locked(uid))
        .map(|(locker, uid)| send_release(locker, uid, is_read_lock, names, config));
    join_all(releases).await;
}

// Like `unlock`, but the releases keep going when the returned future is dropped.
pub(super) async fn spawn_unlock(
    lockers: Vec<Locker>,
    locks: Vec<String>,
    is_read_lock: bool,
    names: Vec<String>,
    config: Config,
) {
    let released = tokio::spawn(async move {
        unlock(&lockers, &locks, is_read_lock, &names, &config).await;
    });
    let _ = released.await;
}

async fn send_release(
    locker: &Locker,
    uid: &str,
    is_read_lock: bool,
    names: &[String],
    config: &Config,
) {
    let op = if is_read_lock { "runlock" } else { "unlock" };
    let locker = match locker {
        Locker::Offline => {
            if config.trace {
                info!("dsync: Unable to call {}: locker is offline", op);
            }
            return;
        }
        Locker::Online(locker) => locker,
    };

    let args = LockArgs {
        uid: uid.to_owned(),
        resources: names.to_vec(),
        source: String::new(),
    };
    let released = if is_read_lock {
        timeout(config.unlock_call_timeout, locker.runlock(&args)).await
    } else {
        timeout(config.unlock_call_timeout, locker.unlock(&args)).await
    };
    if !config.trace {
        return;
    }
    match released {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => info!(
            "dsync: Unable to call {} failed with {} for {:?} at {}",
            op, err, args, locker
        ),
        Err(_) => info!(
            "dsync: Unable to call {} for {:?} at {}: timed out",
            op, args, locker
        ),
    }
}
