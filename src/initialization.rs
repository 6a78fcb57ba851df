//! Boot-time reconstruction of in-memory state from `Store`, and the
//! applier loop that keeps `Access`/`QueueManager`/`Store` converged on the
//! `Changes` journal. Grounded in the original server's initialization
//! sequence: groups before channels before consumers/producers, every item
//! wrapped so one bad entry doesn't abort the rest of the boot.
//!
//! Add/update changes apply `Store -> QueueManager -> Access`; removes
//! apply in the opposite order, `Access -> QueueManager -> Store`, so a
//! crash mid-removal never leaves a session able to reach storage that
//! Store no longer lists.

use crate::access::Access;
use crate::changes::{Change, Entry, Initiator};
use crate::logger::{self, LogCtx};
use crate::queue_manager::QueueManager;
use crate::store::Store;

fn log_group(operation: &str, group: &str, ok: bool, err: Option<&dyn std::fmt::Display>) {
    let ctx = LogCtx {
        operation,
        initiator: Initiator::Root,
        identity: "",
        group,
        channel: "",
        ip: "boot",
    };
    match (ok, err) {
        (true, _) => logger::success(ctx, &[]),
        (false, Some(e)) => logger::fail(ctx, &[], e),
        (false, None) => logger::fail(ctx, &[], &"unknown error"),
    }
}

fn log_channel(operation: &str, group: &str, channel: &str, ok: bool, err: Option<&dyn std::fmt::Display>) {
    let ctx = LogCtx {
        operation,
        initiator: Initiator::Root,
        identity: "",
        group,
        channel,
        ip: "boot",
    };
    match (ok, err) {
        (true, _) => logger::success(ctx, &[]),
        (false, Some(e)) => logger::fail(ctx, &[], e),
        (false, None) => logger::fail(ctx, &[], &"unknown error"),
    }
}

fn log_user(operation: &str, group: &str, channel: &str, login: &str, ok: bool, err: Option<&dyn std::fmt::Display>) {
    let ctx = LogCtx {
        operation,
        initiator: Initiator::Root,
        identity: login,
        group,
        channel,
        ip: "boot",
    };
    match (ok, err) {
        (true, _) => logger::success(ctx, &[]),
        (false, Some(e)) => logger::fail(ctx, &[], e),
        (false, None) => logger::fail(ctx, &[], &"unknown error"),
    }
}

/// Walks `store`'s on-disk tree and populates `access`/`queues` with it.
/// Called once at boot, after any crash-recovery replay has already made
/// `store` reflect the last durably-acknowledged state.
pub fn boot(store: &Store, access: &Access, queues: &QueueManager) {
    access.set_master_password(store.get_master_password());

    for group in store.list_groups() {
        let password = match store.get_direct_group_password(&group) {
            Some(p) => p,
            None => {
                log_group("initialization_group", &group, false, Some(&"missing password file"));
                continue;
            }
        };
        match (access.add_group(&group, password), queues.add_group(&group)) {
            (Ok(()), Ok(())) => log_group("initialization_group", &group, true, None),
            (Err(e), _) => log_group("initialization_group", &group, false, Some(&e)),
            (_, Err(e)) => log_group("initialization_group", &group, false, Some(&e)),
        }

        for channel in store.list_channels(&group) {
            let limits = match store.get_direct_channel_limits(&group, &channel) {
                Some(l) => l,
                None => {
                    log_channel("initialization_channel", &group, &channel, false, Some(&"missing settings file"));
                    continue;
                }
            };
            match (access.add_channel(&group, &channel), queues.add_channel(&group, &channel, limits)) {
                (Ok(()), Ok(())) => log_channel("initialization_channel", &group, &channel, true, None),
                (Err(e), _) => log_channel("initialization_channel", &group, &channel, false, Some(&e)),
                (_, Err(e)) => log_channel("initialization_channel", &group, &channel, false, Some(&e)),
            }

            for login in store.list_consumers(&group, &channel) {
                match store.get_direct_consumer_password(&group, &channel, &login) {
                    Some(password) => match access.add_consumer(&group, &channel, &login, password) {
                        Ok(()) => log_user("initialization_consumer", &group, &channel, &login, true, None),
                        Err(e) => log_user("initialization_consumer", &group, &channel, &login, false, Some(&e)),
                    },
                    None => log_user(
                        "initialization_consumer",
                        &group,
                        &channel,
                        &login,
                        false,
                        Some(&"missing password file"),
                    ),
                }
            }

            for login in store.list_producers(&group, &channel) {
                match store.get_direct_producer_password(&group, &channel, &login) {
                    Some(password) => match access.add_producer(&group, &channel, &login, password) {
                        Ok(()) => log_user("initialization_producer", &group, &channel, &login, true, None),
                        Err(e) => log_user("initialization_producer", &group, &channel, &login, false, Some(&e)),
                    },
                    None => log_user(
                        "initialization_producer",
                        &group,
                        &channel,
                        &login,
                        false,
                        Some(&"missing password file"),
                    ),
                }
            }
        }
    }
}

/// Writes a crash-recovered entry to `Store` alone. `Access`/`QueueManager`
/// are still empty at this point (the caller runs this before [`boot`]), so
/// the subsequent from-`Store` boot is what actually repopulates them;
/// applying the entry there too would just raise spurious `Duplicate*`
/// errors for state the boot walk is about to build anyway.
pub fn replay_pending(store: &Store, pending: &[Entry]) {
    for entry in pending {
        let result = store_op(store, &entry.change);
        let (group, _channel, _login) = change_labels(&entry.change);
        match result {
            Ok(()) => log_group(entry.change.operation(), group, true, None),
            Err(e) => log_group(entry.change.operation(), group, false, Some(&e)),
        }
    }
}

fn store_op(store: &Store, change: &Change) -> std::io::Result<()> {
    match change {
        Change::AddGroup { group, password } => store.write_group_password(group, *password),
        Change::UpdateGroupPassword { group, password } => store.write_group_password(group, *password),
        Change::RemoveGroup { group } => store.remove_group_dir(group),
        Change::AddChannel { group, channel, limits } => store.write_channel_limits(group, channel, *limits),
        Change::UpdateChannelLimits { group, channel, limits } => store.write_channel_limits(group, channel, *limits),
        Change::RemoveChannel { group, channel } => store.remove_channel_dir(group, channel),
        Change::AddConsumer { group, channel, login, password } => {
            store.write_consumer_password(group, channel, login, *password)
        }
        Change::UpdateConsumerPassword { group, channel, login, password } => {
            store.write_consumer_password(group, channel, login, *password)
        }
        Change::RemoveConsumer { group, channel, login } => store.remove_consumer_dir(group, channel, login),
        Change::AddProducer { group, channel, login, password } => {
            store.write_producer_password(group, channel, login, *password)
        }
        Change::UpdateProducerPassword { group, channel, login, password } => {
            store.write_producer_password(group, channel, login, *password)
        }
        Change::RemoveProducer { group, channel, login } => store.remove_producer_dir(group, channel, login),
        Change::UpdateMasterPassword { password } => store.update_master_password(*password),
        Change::UpdatePort { port } => store.update_port(*port),
        Change::UpdateCountThreads { count } => store.update_count_threads(*count),
    }
}

/// Applies one journal entry to the running broker, in the fixed order for
/// its kind, logging the outcome under the entry's own initiator/identity
/// rather than as a boot-time event.
pub fn apply_entry(store: &Store, queues: &QueueManager, access: &Access, entry: &Entry) {
    let result = apply_change(store, queues, access, &entry.change);
    let op = entry.change.operation();
    let (group, channel, login) = change_labels(&entry.change);
    let log_ctx = |op: &'static str| LogCtx {
        operation: op,
        initiator: entry.initiator,
        identity: if login.is_empty() { &entry.identity } else { login },
        group,
        channel,
        ip: &entry.ip,
    };
    match result {
        Ok(()) => logger::success(log_ctx(op), &[]),
        Err(e) => logger::fail(log_ctx(op), &[], &e),
    }
}

fn change_labels(change: &Change) -> (&str, &str, &str) {
    match change {
        Change::AddGroup { group, .. }
        | Change::UpdateGroupPassword { group, .. }
        | Change::RemoveGroup { group } => (group, "", ""),
        Change::AddChannel { group, channel, .. }
        | Change::UpdateChannelLimits { group, channel, .. }
        | Change::RemoveChannel { group, channel } => (group, channel, ""),
        Change::AddConsumer { group, channel, login, .. }
        | Change::UpdateConsumerPassword { group, channel, login, .. }
        | Change::RemoveConsumer { group, channel, login } => (group, channel, login),
        Change::AddProducer { group, channel, login, .. }
        | Change::UpdateProducerPassword { group, channel, login, .. }
        | Change::RemoveProducer { group, channel, login } => (group, channel, login),
        Change::UpdateMasterPassword { .. } | Change::UpdatePort { .. } | Change::UpdateCountThreads { .. } => {
            ("", "", "")
        }
    }
}

fn apply_change(store: &Store, queues: &QueueManager, access: &Access, change: &Change) -> std::io::Result<()> {
    use std::io::{Error, ErrorKind};
    let access_err = |e: crate::error::Error| Error::new(ErrorKind::Other, e.to_string());

    match change {
        Change::AddGroup { group, password } => {
            store.write_group_password(group, *password)?;
            queues.add_group(group).map_err(access_err)?;
            access.add_group(group, *password).map_err(access_err)
        }
        Change::UpdateGroupPassword { group, password } => {
            store.write_group_password(group, *password)?;
            access.update_group_password(group, *password).map_err(access_err)
        }
        Change::RemoveGroup { group } => {
            access.remove_group(group);
            queues.remove_group(group);
            store.remove_group_dir(group)
        }
        Change::AddChannel { group, channel, limits } => {
            store.write_channel_limits(group, channel, *limits)?;
            queues.add_channel(group, channel, *limits).map_err(access_err)?;
            access.add_channel(group, channel).map_err(access_err)
        }
        Change::UpdateChannelLimits { group, channel, limits } => {
            store.write_channel_limits(group, channel, *limits)?;
            queues.update_channel_limits(group, channel, *limits).map_err(access_err)
        }
        Change::RemoveChannel { group, channel } => {
            access.remove_channel(group, channel);
            queues.remove_channel(group, channel);
            store.remove_channel_dir(group, channel)
        }
        Change::AddConsumer { group, channel, login, password } => {
            store.write_consumer_password(group, channel, login, *password)?;
            access.add_consumer(group, channel, login, *password).map_err(access_err)
        }
        Change::UpdateConsumerPassword { group, channel, login, password } => {
            store.write_consumer_password(group, channel, login, *password)?;
            access
                .update_consumer_password(group, channel, login, *password)
                .map_err(access_err)
        }
        Change::RemoveConsumer { group, channel, login } => {
            access.remove_consumer(group, channel, login);
            store.remove_consumer_dir(group, channel, login)
        }
        Change::AddProducer { group, channel, login, password } => {
            store.write_producer_password(group, channel, login, *password)?;
            access.add_producer(group, channel, login, *password).map_err(access_err)
        }
        Change::UpdateProducerPassword { group, channel, login, password } => {
            store.write_producer_password(group, channel, login, *password)?;
            access
                .update_producer_password(group, channel, login, *password)
                .map_err(access_err)
        }
        Change::RemoveProducer { group, channel, login } => {
            access.remove_producer(group, channel, login);
            store.remove_producer_dir(group, channel, login)
        }
        Change::UpdateMasterPassword { password } => {
            store.update_master_password(*password)?;
            access.set_master_password(*password);
            Ok(())
        }
        Change::UpdatePort { port } => store.update_port(*port),
        Change::UpdateCountThreads { count } => store.update_count_threads(*count),
    }
}

/// Runs the applier forever: every tick, pick up anything another process
/// appended to the journal, then drain and apply the in-memory queue.
/// `tick` is the sleep between polls (§4.9 names 50ms).
pub fn run_applier_loop(
    store: &Store,
    queues: &QueueManager,
    access: &Access,
    changes: &crate::changes::Changes,
    tick: std::time::Duration,
    shutdown: &crate::util::BarrierFlag,
) {
    while !shutdown.is_raised() {
        std::thread::sleep(tick);
        if let Err(e) = changes.poll_disk() {
            log::warn!("Fail | poll_changes_journal | ~ | ip=local | error={e}");
        }
        while let Some(entry) = changes.pop() {
            apply_entry(store, queues, access, &entry);
        }
    }
    // Drain whatever landed during shutdown so a quick restart doesn't
    // have to replay it from the crash-recovery path.
    if changes.poll_disk().is_ok() {
        while let Some(entry) = changes.pop() {
            apply_entry(store, queues, access, &entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::hash_password;
    use crate::message_buffer::ChannelLimits;

    fn limits() -> ChannelLimits {
        ChannelLimits {
            min_message_size: 1,
            max_message_size: 1024,
            max_messages_in_memory: 4,
            max_messages_on_disk: 0,
        }
    }

    #[test]
    fn boot_reconstructs_full_tree_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.write_group_password("g", hash_password("pw")).unwrap();
        store.write_channel_limits("g", "c", limits()).unwrap();
        store.write_consumer_password("g", "c", "cons", hash_password("pw")).unwrap();
        store.write_producer_password("g", "c", "prod", hash_password("pw")).unwrap();

        let access = Access::new();
        let queues = QueueManager::new(dir.path());
        boot(&store, &access, &queues);

        access.auth_group("g", "pw", 1).unwrap();
        access.auth_consumer("g", "c", "cons", "pw", 2).unwrap();
        access.auth_producer("g", "c", "prod", "pw", 3).unwrap();
        queues.join_consumer("g", "c", 2).unwrap();
        queues.join_producer("g", "c", 3).unwrap();
    }

    #[test]
    fn replay_pending_writes_store_only_leaving_access_and_queues_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let pending = vec![Entry {
            change: Change::AddGroup { group: "g".into(), password: hash_password("pw") },
            initiator: Initiator::Root,
            identity: "root".into(),
            ip: "127.0.0.1".into(),
        }];
        replay_pending(&store, &pending);
        assert_eq!(store.get_direct_group_password("g"), Some(hash_password("pw")));

        let access = Access::new();
        let queues = QueueManager::new(dir.path());
        boot(&store, &access, &queues);
        access.auth_group("g", "pw", 1).unwrap();
    }

    #[test]
    fn apply_entry_add_channel_reaches_store_queues_and_access() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let access = Access::new();
        let queues = QueueManager::new(dir.path());
        access.add_group("g", hash_password("pw")).unwrap();
        queues.add_group("g").unwrap();
        store.write_group_password("g", hash_password("pw")).unwrap();

        let entry = Entry {
            change: Change::AddChannel { group: "g".into(), channel: "c".into(), limits: limits() },
            initiator: Initiator::Group,
            identity: "g".into(),
            ip: "10.0.0.1".into(),
        };
        apply_entry(&store, &queues, &access, &entry);

        assert_eq!(store.get_direct_channel_limits("g", "c"), Some(limits()));
        assert!(store.list_channels("g").contains(&"c".to_string()));
    }
}
