//! Line-oriented admin REPL (`simq-server manager <path>`): the command
//! surface of the original's interactive manager, without its full-screen
//! menu/editor UX (out of scope — see the external-interfaces section).
//! Reads go straight to `Store`'s direct accessors; writes only ever go
//! through `Changes::push_deferred`, so the running broker (a separate
//! process sharing the same on-disk layout) picks them up on its next
//! applier tick via [`crate::changes::Changes::poll_disk`].

use std::io::{self, Write};
use std::path::Path;

use crate::access::hash_password;
use crate::changes::{Change, Changes, Entry, Initiator};
use crate::message_buffer::ChannelLimits;
use crate::store::Store;

/// Where the REPL currently is: `[]` is root, `["groups", g]` is a group,
/// `["groups", g, c]` is a channel, `["groups", g, c, "consumers", u]` a
/// consumer, `["settings"]` the server settings.
#[derive(Default, Clone)]
struct Ctx(Vec<String>);

impl Ctx {
    fn display(&self) -> String {
        if self.0.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", self.0.join("/"))
        }
    }

    /// Borrowed view for slice-pattern matching against string literals.
    fn parts(&self) -> Vec<&str> {
        self.0.iter().map(|s| s.as_str()).collect()
    }
}

pub fn run(root: &Path) -> anyhow::Result<()> {
    let store = Store::open(root)?;
    let (changes, _pending) = Changes::open(&store.changes_dir())?;

    let mut ctx = Ctx::default();
    let stdin = io::stdin();
    loop {
        print!("simq {}> ", ctx.display());
        io::stdout().flush().ok();
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break; // EOF
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let cmd = parts.next().unwrap_or("");
        let args: Vec<&str> = parts.collect();

        let result = match cmd {
            "h" | "help" => {
                print_help(&ctx);
                Ok(())
            }
            "ls" => cmd_ls(&store, &ctx, args.first().copied()),
            "cd" => cmd_cd(&store, &mut ctx, args.first().copied().unwrap_or("")),
            "info" => cmd_info(&store, &ctx, args.first().copied()),
            "add" => cmd_add(&store, &changes, &ctx, &args),
            "rm" => cmd_rm(&store, &changes, &ctx, &args),
            "passwd" => cmd_passwd(&changes, &ctx, &args),
            "set" => cmd_set(&store, &changes, &ctx, &args),
            "quit" | "exit" => break,
            other => Err(anyhow::anyhow!("unknown command: {other} (try `h`)")),
        };
        if let Err(e) = result {
            println!("error: {e}");
        }
    }
    Ok(())
}

fn print_help(ctx: &Ctx) {
    let commands: &[&str] = match ctx.parts().as_slice() {
        [] => &["ls", "cd", "h"],
        ["groups"] => &["ls", "cd", "add", "rm", "h"],
        ["settings"] => &["ls", "info", "set", "passwd", "h"],
        ["groups", _] => &["ls", "cd", "add", "rm", "passwd", "h"],
        ["groups", _, _] => &["ls", "cd", "info", "set", "rm", "h"],
        ["groups", _, _, _] => &["ls", "cd", "add", "rm", "h"],
        ["groups", _, _, _, _] => &["ls", "info", "passwd", "rm", "h"],
        _ => &["ls", "h"],
    };
    println!("allowed here: {}", commands.join(", "));
}

fn children(store: &Store, ctx: &Ctx) -> Vec<String> {
    match ctx.parts().as_slice() {
        [] => vec!["groups".to_string(), "settings".to_string()],
        ["groups"] => store.list_groups(),
        ["settings"] => Vec::new(),
        ["groups", group] => {
            let mut v = store.list_channels(group);
            v.sort();
            v
        }
        ["groups", group, channel] => {
            let consumers = store.list_consumers(group, channel).len();
            let producers = store.list_producers(group, channel).len();
            vec![format!("consumers ({consumers})"), format!("producers ({producers})")]
        }
        ["groups", group, channel, "consumers"] => store.list_consumers(group, channel),
        ["groups", group, channel, "producers"] => store.list_producers(group, channel),
        _ => Vec::new(),
    }
}

fn cmd_ls(store: &Store, ctx: &Ctx, query: Option<&str>) -> anyhow::Result<()> {
    let mut items = children(store, ctx);
    if let Some(q) = query {
        items.retain(|i| i.contains(q));
    }
    if items.is_empty() {
        println!("(empty)");
    } else {
        for item in items {
            println!("{item}");
        }
    }
    Ok(())
}

fn cmd_cd(store: &Store, ctx: &mut Ctx, target: &str) -> anyhow::Result<()> {
    if target.is_empty() {
        return Ok(());
    }
    if target == "/" {
        ctx.0.clear();
        return Ok(());
    }
    if target == ".." {
        ctx.0.pop();
        return Ok(());
    }
    let mut candidate = ctx.clone();
    if let Some(rest) = target.strip_prefix('/') {
        candidate.0.clear();
        for seg in rest.split('/').filter(|s| !s.is_empty()) {
            candidate.0.push(seg.to_string());
        }
    } else {
        for seg in target.split('/').filter(|s| !s.is_empty()) {
            if seg == ".." {
                candidate.0.pop();
            } else {
                candidate.0.push(seg.to_string());
            }
        }
    }
    if !path_exists(store, &candidate) {
        anyhow::bail!("no such path: /{}", candidate.0.join("/"));
    }
    *ctx = candidate;
    Ok(())
}

fn path_exists(store: &Store, ctx: &Ctx) -> bool {
    match ctx.parts().as_slice() {
        [] => true,
        ["groups"] | ["settings"] => true,
        ["groups", group] => store.list_groups().iter().any(|g| g == group),
        ["groups", group, channel] => store.list_channels(group).iter().any(|c| c == channel),
        ["groups", group, channel, "consumers"] | ["groups", group, channel, "producers"] => {
            store.list_channels(group).iter().any(|c| c == channel)
        }
        ["groups", group, channel, "consumers", u] => store.get_direct_consumer_password(group, channel, u).is_some(),
        ["groups", group, channel, "producers", u] => store.get_direct_producer_password(group, channel, u).is_some(),
        _ => false,
    }
}

fn cmd_info(store: &Store, ctx: &Ctx, _query: Option<&str>) -> anyhow::Result<()> {
    match ctx.parts().as_slice() {
        ["settings"] => {
            println!("port: {}", store.get_port());
            println!("count_threads: {}", store.get_count_threads());
        }
        ["groups", group, channel] => match store.get_direct_channel_limits(group, channel) {
            Some(l) => {
                println!("minMessageSize: {}", l.min_message_size);
                println!("maxMessageSize: {}", l.max_message_size);
                println!("maxMessagesInMemory: {}", l.max_messages_in_memory);
                println!("maxMessagesOnDisk: {}", l.max_messages_on_disk);
            }
            None => println!("(no limits recorded)"),
        },
        ["groups", group, channel, "consumers", u] => {
            let present = store.get_direct_consumer_password(group, channel, u).is_some();
            println!("login: {u}");
            println!("exists: {present}");
        }
        ["groups", group, channel, "producers", u] => {
            let present = store.get_direct_producer_password(group, channel, u).is_some();
            println!("login: {u}");
            println!("exists: {present}");
        }
        _ => anyhow::bail!("`info` isn't available here"),
    }
    Ok(())
}

fn default_channel_limits() -> ChannelLimits {
    ChannelLimits {
        min_message_size: 1,
        max_message_size: 1 << 20,
        max_messages_in_memory: 1024,
        max_messages_on_disk: 0,
    }
}

fn read_password(prompt: &str) -> io::Result<String> {
    print!("{prompt}: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn push(changes: &Changes, change: Change) -> anyhow::Result<()> {
    changes.push_deferred(Entry {
        change,
        initiator: Initiator::Root,
        identity: "admin".to_string(),
        ip: "admin-cli".to_string(),
    })?;
    Ok(())
}

fn cmd_add(store: &Store, changes: &Changes, ctx: &Ctx, args: &[&str]) -> anyhow::Result<()> {
    let _ = store;
    let name = *args.first().ok_or_else(|| anyhow::anyhow!("usage: add <name>"))?;
    match ctx.parts().as_slice() {
        ["groups"] => {
            let password = hash_password(&read_password("password")?);
            push(changes, Change::AddGroup { group: name.to_string(), password })
        }
        ["groups", group] => push(
            changes,
            Change::AddChannel {
                group: group.to_string(),
                channel: name.to_string(),
                limits: default_channel_limits(),
            },
        ),
        ["groups", group, channel, "consumers"] => {
            let password = hash_password(&read_password("password")?);
            push(
                changes,
                Change::AddConsumer {
                    group: group.to_string(),
                    channel: channel.to_string(),
                    login: name.to_string(),
                    password,
                },
            )
        }
        ["groups", group, channel, "producers"] => {
            let password = hash_password(&read_password("password")?);
            push(
                changes,
                Change::AddProducer {
                    group: group.to_string(),
                    channel: channel.to_string(),
                    login: name.to_string(),
                    password,
                },
            )
        }
        _ => anyhow::bail!("`add` isn't available here"),
    }
}

fn cmd_rm(_store: &Store, changes: &Changes, ctx: &Ctx, args: &[&str]) -> anyhow::Result<()> {
    let name = *args.first().ok_or_else(|| anyhow::anyhow!("usage: rm <name>"))?;
    match ctx.parts().as_slice() {
        ["groups"] => push(changes, Change::RemoveGroup { group: name.to_string() }),
        ["groups", group] => push(changes, Change::RemoveChannel { group: group.to_string(), channel: name.to_string() }),
        ["groups", group, channel, "consumers"] => push(
            changes,
            Change::RemoveConsumer { group: group.to_string(), channel: channel.to_string(), login: name.to_string() },
        ),
        ["groups", group, channel, "producers"] => push(
            changes,
            Change::RemoveProducer { group: group.to_string(), channel: channel.to_string(), login: name.to_string() },
        ),
        _ => anyhow::bail!("`rm` isn't available here"),
    }
}

fn cmd_passwd(changes: &Changes, ctx: &Ctx, _args: &[&str]) -> anyhow::Result<()> {
    let password = hash_password(&read_password("new password")?);
    match ctx.parts().as_slice() {
        ["settings"] => push(changes, Change::UpdateMasterPassword { password }),
        ["groups", group] => push(changes, Change::UpdateGroupPassword { group: group.to_string(), password }),
        ["groups", group, channel, "consumers", u] => push(
            changes,
            Change::UpdateConsumerPassword {
                group: group.to_string(),
                channel: channel.to_string(),
                login: u.to_string(),
                password,
            },
        ),
        ["groups", group, channel, "producers", u] => push(
            changes,
            Change::UpdateProducerPassword {
                group: group.to_string(),
                channel: channel.to_string(),
                login: u.to_string(),
                password,
            },
        ),
        _ => anyhow::bail!("`passwd` isn't available here"),
    }
}

fn cmd_set(store: &Store, changes: &Changes, ctx: &Ctx, args: &[&str]) -> anyhow::Result<()> {
    if args.len() < 2 {
        anyhow::bail!("usage: set <key> <value>");
    }
    let key = args[0];
    let value = args[1];
    match ctx.parts().as_slice() {
        ["settings"] => match key {
            "port" => {
                let port: u16 = value.parse().map_err(|_| anyhow::anyhow!("port must be 1-65535"))?;
                push(changes, Change::UpdatePort { port })
            }
            "count_threads" => {
                let count: u16 =
                    value.parse().map_err(|_| anyhow::anyhow!("count_threads must be a positive integer"))?;
                push(changes, Change::UpdateCountThreads { count })
            }
            other => anyhow::bail!("unknown settings key: {other}"),
        },
        ["groups", group, channel] => {
            let mut limits = store.get_direct_channel_limits(group, channel).unwrap_or_else(default_channel_limits);
            let parsed: u32 = value.parse().map_err(|_| anyhow::anyhow!("{key} must be a non-negative integer"))?;
            match key {
                "minMessageSize" => limits.min_message_size = parsed,
                "maxMessageSize" => limits.max_message_size = parsed,
                "maxMessagesInMemory" => limits.max_messages_in_memory = parsed,
                "maxMessagesOnDisk" => limits.max_messages_on_disk = parsed,
                other => anyhow::bail!("unknown channel limit key: {other}"),
            }
            push(
                changes,
                Change::UpdateChannelLimits {
                    group: group.to_string(),
                    channel: channel.to_string(),
                    limits: limits.repaired(),
                },
            )
        }
        _ => anyhow::bail!("`set` isn't available here"),
    }
}
