//! In-memory storage cluster
//!
//! Interprets the command vocabulary emitted by [`super::commands`] against
//! a simulated set of hosts: disks, physical volumes, volume groups, thin
//! pools, mounts, fstab lines, gluster volumes and gluster-block targets.
//! Failure messages mirror the real tools closely enough for the
//! idempotency checks in the brick and volume commands to recognise them.
//!
//! Used by `executor.kind = "fake"` and by the test suites.

use super::{Cmd, CmdResult, CommandExecutor, HostThrottle};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::debug;

const EXTENT_SIZE: u64 = 4096;
const PV_METADATA: u64 = 128 * 1024;

#[derive(Debug)]
enum FakeLv {
    Pool { size: u64, metadata: u64 },
    Thin { pool: String, formatted: bool },
}

#[derive(Debug)]
struct FakeVg {
    pv: String,
    capacity: u64,
    lvs: BTreeMap<String, FakeLv>,
}

impl FakeVg {
    fn allocated(&self) -> u64 {
        self.lvs
            .values()
            .map(|lv| match lv {
                FakeLv::Pool { size, metadata } => size + metadata,
                FakeLv::Thin { .. } => 0,
            })
            .sum()
    }

    fn thin_count(&self, pool: &str) -> usize {
        self.lvs
            .values()
            .filter(|lv| matches!(lv, FakeLv::Thin { pool: p, .. } if p == pool))
            .count()
    }
}

#[derive(Debug, Default)]
struct FakeHost {
    disks: BTreeMap<String, u64>,
    pvs: BTreeSet<String>,
    vgs: BTreeMap<String, FakeVg>,
    dirs: BTreeSet<String>,
    /// mount dir -> device path
    mounts: BTreeMap<String, String>,
    fstab: Vec<String>,
}

#[derive(Debug)]
struct FakeVolume {
    id: String,
    replica: u32,
    started: bool,
    bricks: Vec<String>,
}

#[derive(Debug)]
struct FakeBlock {
    gbid: String,
    size: u64,
    hosts: Vec<String>,
}

#[derive(Debug, Default)]
struct FakeState {
    hosts: BTreeMap<String, FakeHost>,
    volumes: BTreeMap<String, FakeVolume>,
    /// keyed by `hosting/name`
    blocks: BTreeMap<String, FakeBlock>,
}

pub struct FakeCluster {
    state: Mutex<FakeState>,
    throttle: HostThrottle,
}

// =============================================================================
// Result helpers
// =============================================================================

fn ok(output: impl Into<String>) -> CmdResult {
    CmdResult::success(output)
}

fn fail(code: i32, stderr: impl Into<String>) -> CmdResult {
    CmdResult::failure(code, stderr)
}

fn fail_json(code: i32, msg: impl Into<String>) -> CmdResult {
    CmdResult {
        completed: true,
        output: json!({ "RESULT": "FAIL", "errCode": code, "errMsg": msg.into() }).to_string(),
        err_output: String::new(),
        exit_status: code,
        error: Some(format!("exit status {}", code)),
    }
}

fn lv_missing(target: &str) -> CmdResult {
    fail(5, format!("  Failed to find logical volume \"{}\"", target))
}

fn kib(value: &str) -> Option<u64> {
    value.strip_suffix('K').unwrap_or(value).parse().ok()
}

fn gib(value: &str) -> Option<u64> {
    value.strip_suffix("GiB").unwrap_or(value).parse().ok()
}

/// Split a command line on whitespace, honouring single and double quotes
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_token = false;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

const PROGRAMS: &[&str] = &[
    "mkdir",
    "rmdir",
    "chown",
    "chmod",
    "echo",
    "sed",
    "mount",
    "umount",
    "mkfs.xfs",
    "pvcreate",
    "pvremove",
    "vgcreate",
    "vgremove",
    "vgdisplay",
    "lvcreate",
    "lvremove",
    "lvs",
    "gluster",
    "gluster-block",
];

/// Value following `flag`, either as `--flag value` or `--flag=value`
fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    let prefix = format!("{}=", flag);
    args.iter().enumerate().find_map(|(i, a)| {
        if a == flag {
            args.get(i + 1).map(String::as_str)
        } else {
            a.strip_prefix(&prefix)
        }
    })
}

/// Arguments that are neither flags nor flag values
fn positional<'a>(args: &'a [String], valued: &[&str]) -> Vec<&'a str> {
    let mut out = Vec::new();
    let mut skip = false;
    for a in args {
        if skip {
            skip = false;
            continue;
        }
        if a.starts_with('-') {
            skip = valued.contains(&a.as_str());
            continue;
        }
        out.push(a.as_str());
    }
    out
}

// =============================================================================
// Cluster
// =============================================================================

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            throttle: HostThrottle::new(),
        }
    }

    pub fn add_host(&self, host: &str) {
        let mut state = self.state.lock();
        let entry = state.hosts.entry(host.to_string()).or_default();
        entry.dirs.insert("/".to_string());
    }

    /// Attach a raw disk of `size` KiB to a host
    pub fn add_disk(&self, host: &str, device: &str, size: u64) {
        let mut state = self.state.lock();
        let entry = state.hosts.entry(host.to_string()).or_default();
        entry.disks.insert(device.to_string(), size);
    }

    /// KiB reserved by thin pools across every host
    pub fn allocated(&self) -> u64 {
        let state = self.state.lock();
        state
            .hosts
            .values()
            .flat_map(|h| h.vgs.values())
            .map(FakeVg::allocated)
            .sum()
    }

    /// Logical volume names on a host
    pub fn logical_volumes(&self, host: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .hosts
            .get(host)
            .map(|h| {
                h.vgs
                    .values()
                    .flat_map(|vg| vg.lvs.keys().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn volume_group_exists(&self, host: &str, vg: &str) -> bool {
        let state = self.state.lock();
        state
            .hosts
            .get(host)
            .is_some_and(|h| h.vgs.contains_key(vg))
    }

    pub fn is_mounted(&self, host: &str, dir: &str) -> bool {
        let state = self.state.lock();
        state
            .hosts
            .get(host)
            .is_some_and(|h| h.mounts.contains_key(dir))
    }

    pub fn volume_bricks(&self, name: &str) -> Option<Vec<String>> {
        self.state.lock().volumes.get(name).map(|v| v.bricks.clone())
    }

    pub fn volume_exists(&self, name: &str) -> bool {
        self.state.lock().volumes.contains_key(name)
    }

    /// Nominal size in GiB of a block volume
    pub fn block_volume_size(&self, hosting: &str, name: &str) -> Option<u64> {
        self.state
            .lock()
            .blocks
            .get(&format!("{}/{}", hosting, name))
            .map(|b| b.size)
    }

    fn run(&self, host: &str, line: &str) -> CmdResult {
        let tokens = tokenize(line);
        let Some(start) = tokens.iter().position(|t| PROGRAMS.contains(&t.as_str())) else {
            return fail(127, format!("sh: {}: command not found", line));
        };
        let program = tokens[start].as_str();
        let args = &tokens[start + 1..];

        let mut guard = self.state.lock();
        let state = &mut *guard;
        match program {
            "gluster" => return gluster(state, args),
            "gluster-block" => return gluster_block(state, args),
            _ => {}
        }
        let Some(h) = state.hosts.get_mut(host) else {
            return fail(255, format!("ssh: Could not resolve hostname {}", host));
        };
        match program {
            "mkdir" | "rmdir" | "chown" | "chmod" => files(h, program, args),
            "echo" | "sed" => fstab(h, program, args),
            "mount" | "umount" | "mkfs.xfs" => mounts(h, program, args),
            "pvcreate" | "pvremove" | "vgcreate" | "vgremove" | "vgdisplay" => vgs(h, program, args),
            _ => lvs(h, program, args),
        }
    }
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for FakeCluster {
    async fn exec_commands(
        &self,
        host: &str,
        commands: &[Cmd],
        _timeout: Duration,
    ) -> Result<Vec<CmdResult>> {
        if !self.state.lock().hosts.contains_key(host) {
            return Err(Error::unreachable(host, "no route to host"));
        }
        let _permit = self.throttle.acquire(host).await?;

        let mut results = Vec::with_capacity(commands.len());
        for cmd in commands {
            let result = self.run(host, &cmd.command);
            if !cmd.quiet {
                debug!(host, command = %cmd.command, exit = result.exit_status, "fake exec");
            }
            let failed = !result.is_ok();
            results.push(result);
            if failed {
                break;
            }
        }
        results.resize(commands.len(), CmdResult::default());
        Ok(results)
    }
}

// =============================================================================
// Files, fstab and mounts
// =============================================================================

fn files(h: &mut FakeHost, program: &str, args: &[String]) -> CmdResult {
    let parents = args.iter().any(|a| a == "-p");
    let Some(path) = positional(args, &[]).last().map(|p| p.to_string()) else {
        return fail(1, format!("{}: missing operand", program));
    };
    match program {
        "mkdir" => {
            if h.dirs.contains(&path) && !parents {
                return fail(
                    1,
                    format!("mkdir: cannot create directory '{}': File exists", path),
                );
            }
            h.dirs.insert(path);
            ok("")
        }
        "rmdir" => {
            if !h.dirs.contains(&path) {
                return fail(
                    1,
                    format!("rmdir: failed to remove '{}': No such file or directory", path),
                );
            }
            if h.mounts.contains_key(&path) {
                return fail(
                    1,
                    format!("rmdir: failed to remove '{}': Device or resource busy", path),
                );
            }
            let child = format!("{}/", path);
            if h.dirs.iter().any(|d| d.starts_with(&child)) {
                return fail(
                    1,
                    format!("rmdir: failed to remove '{}': Directory not empty", path),
                );
            }
            h.dirs.remove(&path);
            ok("")
        }
        _ => {
            if !h.dirs.contains(&path) {
                return fail(
                    1,
                    format!("{}: cannot access '{}': No such file or directory", program, path),
                );
            }
            ok("")
        }
    }
}

fn fstab(h: &mut FakeHost, program: &str, args: &[String]) -> CmdResult {
    if program == "echo" {
        match args {
            [line, redirect, _file] if redirect == ">>" => {
                h.fstab.push(line.clone());
                ok("")
            }
            _ => fail(2, "echo: unsupported redirection"),
        }
    } else {
        let Some(pattern) = args
            .iter()
            .find_map(|a| a.strip_prefix('/').and_then(|a| a.strip_suffix("/d")))
        else {
            return fail(1, "sed: -e expression #1: unknown command");
        };
        h.fstab.retain(|l| !l.contains(pattern));
        ok("")
    }
}

fn find_thin<'a>(h: &'a mut FakeHost, device: &str) -> Option<&'a mut FakeLv> {
    let rest = device.strip_prefix("/dev/")?;
    let (vg, lv) = rest.split_once('/')?;
    match h.vgs.get_mut(vg)?.lvs.get_mut(lv)? {
        lv @ FakeLv::Thin { .. } => Some(lv),
        FakeLv::Pool { .. } => None,
    }
}

fn mounts(h: &mut FakeHost, program: &str, args: &[String]) -> CmdResult {
    let pos = positional(args, &["-o", "-i", "-n"]);
    match program {
        "mkfs.xfs" => {
            let Some(device) = pos.last() else {
                return fail(1, "mkfs.xfs: no device name given");
            };
            match find_thin(h, device) {
                Some(FakeLv::Thin { formatted, .. }) => {
                    *formatted = true;
                    ok("meta-data=... isize=512")
                }
                _ => fail(
                    1,
                    format!("mkfs.xfs: cannot open {}: No such file or directory", device),
                ),
            }
        }
        "mount" => {
            let [device, dir] = pos[..] else {
                return fail(1, "mount: bad usage");
            };
            if !h.dirs.contains(dir) {
                return fail(32, format!("mount: {}: mount point does not exist.", dir));
            }
            if h.mounts.contains_key(dir) {
                return fail(32, format!("mount: {}: {} already mounted", dir, device));
            }
            match find_thin(h, device) {
                Some(FakeLv::Thin {
                    formatted: true, ..
                }) => {}
                Some(_) => {
                    return fail(
                        32,
                        format!("mount: {}: wrong fs type, bad option, bad superblock", dir),
                    )
                }
                None => {
                    return fail(32, format!("mount: {}: special device {} does not exist.", dir, device))
                }
            }
            h.mounts.insert(dir.to_string(), device.to_string());
            ok("")
        }
        _ => {
            let Some(dir) = pos.last() else {
                return fail(1, "umount: bad usage");
            };
            if h.mounts.remove(*dir).is_none() {
                return fail(32, format!("umount: {}: not mounted.", dir));
            }
            // directories created on the filesystem go away with it
            let child = format!("{}/", dir);
            h.dirs.retain(|d| !d.starts_with(&child));
            ok("")
        }
    }
}

// =============================================================================
// LVM
// =============================================================================

fn vgs(h: &mut FakeHost, program: &str, args: &[String]) -> CmdResult {
    let pos = positional(args, &[]);
    match program {
        "pvcreate" => {
            let Some(device) = pos.last().map(|d| d.to_string()) else {
                return fail(3, "pvcreate: Please enter a physical volume path.");
            };
            if !h.disks.contains_key(&device) {
                return fail(5, format!("  Device {} not found.", device));
            }
            if !h.pvs.insert(device.clone()) {
                return fail(
                    5,
                    format!("  Can't initialize physical volume \"{}\": already a PV", device),
                );
            }
            ok(format!("  Physical volume \"{}\" successfully created.", device))
        }
        "pvremove" => {
            let Some(device) = pos.last().map(|d| d.to_string()) else {
                return fail(3, "pvremove: Please enter a physical volume path");
            };
            if !h.pvs.contains(&device) {
                return fail(5, format!("  No PV found on device {}.", device));
            }
            if let Some(vg) = h.vgs.iter().find(|(_, vg)| vg.pv == device).map(|(n, _)| n) {
                return fail(
                    5,
                    format!("  PV {} is used by VG {} so please use vgreduce first.", device, vg),
                );
            }
            h.pvs.remove(&device);
            ok("")
        }
        "vgcreate" => {
            let [name, device] = pos[..] else {
                return fail(3, "vgcreate: Please provide volume group name and physical volumes");
            };
            if !h.pvs.contains(device) {
                return fail(5, format!("  Device {} not found or not a PV.", device));
            }
            if h.vgs.contains_key(name) {
                return fail(5, format!("  A volume group called {} already exists.", name));
            }
            if h.vgs.values().any(|vg| vg.pv == device) {
                return fail(
                    5,
                    format!("  Physical volume '{}' is already in volume group", device),
                );
            }
            let disk = h.disks.get(device).copied().unwrap_or(0);
            let capacity = disk.saturating_sub(PV_METADATA) / EXTENT_SIZE * EXTENT_SIZE;
            h.vgs.insert(
                name.to_string(),
                FakeVg {
                    pv: device.to_string(),
                    capacity,
                    lvs: BTreeMap::new(),
                },
            );
            ok(format!("  Volume group \"{}\" successfully created", name))
        }
        "vgremove" => {
            let Some(name) = pos.last() else {
                return fail(3, "vgremove: Please enter one or more volume group paths");
            };
            match h.vgs.get(*name).map(|vg| vg.lvs.len()) {
                None => fail(5, format!("  Volume group \"{}\" not found", name)),
                Some(0) => {
                    h.vgs.remove(*name);
                    ok(format!("  Volume group \"{}\" successfully removed", name))
                }
                Some(count) => fail(
                    5,
                    format!(
                        "  Volume group \"{}\" still contains {} logical volume(s)",
                        name, count
                    ),
                ),
            }
        }
        _ => {
            let Some(name) = pos.last() else {
                return fail(3, "vgdisplay: missing name");
            };
            let Some(vg) = h.vgs.get(*name) else {
                return fail(5, format!("  Volume group \"{}\" not found", name));
            };
            let total = vg.capacity / EXTENT_SIZE;
            let alloc = vg.allocated().div_ceil(EXTENT_SIZE);
            ok(format!(
                "  {}:r/w:772:-1:0:{}:{}:-1:0:1:1:{}:{}:{}:{}:{}:fake-{}\n",
                name,
                vg.lvs.len(),
                vg.lvs.len(),
                vg.capacity,
                EXTENT_SIZE,
                total,
                alloc,
                (vg.capacity - vg.allocated()) / EXTENT_SIZE,
                name
            ))
        }
    }
}

fn lvs(h: &mut FakeHost, program: &str, args: &[String]) -> CmdResult {
    match program {
        "lvcreate" => {
            let (Some(meta), Some(size), Some(thin), Some(_), Some(name)) = (
                flag_value(args, "--poolmetadatasize").and_then(kib),
                flag_value(args, "--size").and_then(kib),
                flag_value(args, "--thin"),
                flag_value(args, "--virtualsize").and_then(kib),
                flag_value(args, "--name"),
            ) else {
                return fail(3, "lvcreate: unsupported arguments");
            };
            let Some((vg_name, pool)) = thin.split_once('/') else {
                return fail(3, format!("lvcreate: bad pool path {}", thin));
            };
            let Some(vg) = h.vgs.get_mut(vg_name) else {
                return fail(5, format!("  Volume group \"{}\" not found", vg_name));
            };
            for lv in [pool, name] {
                if vg.lvs.contains_key(lv) {
                    return fail(
                        5,
                        format!(
                            "  Logical Volume \"{}\" already exists in volume group \"{}\"",
                            lv, vg_name
                        ),
                    );
                }
            }
            let free = vg.capacity - vg.allocated();
            if size + meta > free {
                return fail(
                    5,
                    format!(
                        "  Volume group \"{}\" has insufficient free space ({} extents): {} required.",
                        vg_name,
                        free / EXTENT_SIZE,
                        (size + meta).div_ceil(EXTENT_SIZE)
                    ),
                );
            }
            vg.lvs.insert(
                pool.to_string(),
                FakeLv::Pool {
                    size,
                    metadata: meta,
                },
            );
            vg.lvs.insert(
                name.to_string(),
                FakeLv::Thin {
                    pool: pool.to_string(),
                    formatted: false,
                },
            );
            ok(format!("  Logical volume \"{}\" created.", name))
        }
        "lvremove" => {
            let Some(target) = positional(args, &[]).last().map(|t| t.to_string()) else {
                return fail(3, "lvremove: Please enter one or more logical volume paths");
            };
            let Some((vg_name, lv_name)) = target.split_once('/') else {
                return lv_missing(&target);
            };
            let device = format!("/dev/{}", target);
            let in_use = h.mounts.values().any(|d| *d == device);
            let Some(vg) = h.vgs.get_mut(vg_name) else {
                return lv_missing(&target);
            };
            let busy = match vg.lvs.get(lv_name) {
                None => return lv_missing(&target),
                Some(FakeLv::Thin { .. }) => in_use,
                Some(FakeLv::Pool { .. }) => vg.thin_count(lv_name) > 0,
            };
            if busy {
                return fail(5, format!("  Logical volume {} in use.", target));
            }
            vg.lvs.remove(lv_name);
            ok(format!("  Logical volume \"{}\" successfully removed", lv_name))
        }
        _ => {
            let Some(target) = positional(args, &[]).last().map(|t| t.to_string()) else {
                return fail(3, "lvs: missing target");
            };
            let found = target.split_once('/').and_then(|(vg_name, lv_name)| {
                let vg = h.vgs.get(vg_name)?;
                match vg.lvs.get(lv_name)? {
                    FakeLv::Pool { .. } => Some(vg.thin_count(lv_name)),
                    FakeLv::Thin { .. } => Some(0),
                }
            });
            match found {
                Some(count) => ok(format!("  {}\n", count)),
                None => lv_missing(&target),
            }
        }
    }
}

// =============================================================================
// gluster
// =============================================================================

fn brick_exists(state: &FakeState, brick: &str) -> bool {
    brick
        .split_once(':')
        .and_then(|(host, path)| state.hosts.get(host).map(|h| h.dirs.contains(path)))
        .unwrap_or(false)
}

/// Split `[replica N] [disperse-data D redundancy R] bricks... [force]`
fn layout(args: &[String]) -> (u32, Vec<String>) {
    let mut replica = 1;
    let mut bricks = Vec::new();
    let mut iter = args.iter();
    while let Some(a) = iter.next() {
        match a.as_str() {
            "replica" => {
                replica = iter.next().and_then(|n| n.parse().ok()).unwrap_or(1);
            }
            "disperse-data" | "redundancy" => {
                iter.next();
            }
            "force" => {}
            brick => bricks.push(brick.to_string()),
        }
    }
    (replica, bricks)
}

fn volume_xml(name: &str, volume: &FakeVolume) -> String {
    let bricks: String = volume
        .bricks
        .iter()
        .map(|b| format!("<brick uuid=\"x\"><name>{}</name><hostUuid>x</hostUuid></brick>", b))
        .collect();
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
         <cliOutput><opRet>0</opRet><opErrno>0</opErrno><opErrstr/><volInfo><volumes>\
         <volume><name>{}</name><id>{}</id><status>{}</status><statusStr>{}</statusStr>\
         <brickCount>{}</brickCount><replicaCount>{}</replicaCount><bricks>{}</bricks></volume>\
         <count>1</count></volumes></volInfo></cliOutput>",
        name,
        volume.id,
        volume.started as u8,
        if volume.started { "Started" } else { "Stopped" },
        volume.bricks.len(),
        volume.replica,
        bricks
    )
}

fn volume_missing_xml(name: &str) -> CmdResult {
    CmdResult {
        completed: true,
        output: format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
             <cliOutput><opRet>-1</opRet><opErrno>30800</opErrno>\
             <opErrstr>Volume {} does not exist</opErrstr></cliOutput>",
            name
        ),
        err_output: String::new(),
        exit_status: 1,
        error: Some("exit status 1".to_string()),
    }
}

fn gluster(state: &mut FakeState, args: &[String]) -> CmdResult {
    let args: Vec<String> = args.iter().filter(|a| !a.starts_with("--")).cloned().collect();
    let (Some("volume"), Some(sub), Some(name)) = (
        args.first().map(String::as_str),
        args.get(1).map(String::as_str),
        args.get(2),
    ) else {
        return fail(1, "gluster: unrecognized command");
    };
    let rest = &args[3..];

    match sub {
        "create" => {
            if state.volumes.contains_key(name) {
                return fail(1, format!("volume create: {}: failed: Volume {} already exists", name, name));
            }
            let (replica, bricks) = layout(rest);
            if let Some(missing) = bricks.iter().find(|b| !brick_exists(state, b)) {
                return fail(
                    1,
                    format!("volume create: {}: failed: The brick {} does not exist", name, missing),
                );
            }
            state.volumes.insert(
                name.clone(),
                FakeVolume {
                    id: crate::model::new_id(),
                    replica,
                    started: false,
                    bricks,
                },
            );
            ok(format!("volume create: {}: success", name))
        }
        "add-brick" => {
            let (_, bricks) = layout(rest);
            if let Some(missing) = bricks.iter().find(|b| !brick_exists(state, b)) {
                return fail(
                    1,
                    format!("volume add-brick: failed: The brick {} does not exist", missing),
                );
            }
            let Some(volume) = state.volumes.get_mut(name) else {
                return fail(1, format!("volume add-brick: failed: Volume {} does not exist", name));
            };
            volume.bricks.extend(bricks);
            ok("volume add-brick: success")
        }
        "start" => match state.volumes.get_mut(name) {
            None => fail(1, format!("volume start: {}: failed: Volume {} does not exist", name, name)),
            Some(v) if v.started => {
                fail(1, format!("volume start: {}: failed: Volume {} already started", name, name))
            }
            Some(v) => {
                v.started = true;
                ok(format!("volume start: {}: success", name))
            }
        },
        "stop" => match state.volumes.get_mut(name) {
            None => fail(1, format!("volume stop: {}: failed: Volume {} does not exist", name, name)),
            Some(v) if !v.started => fail(
                1,
                format!("volume stop: {}: failed: Volume {} is not in the started state", name, name),
            ),
            Some(v) => {
                v.started = false;
                ok(format!("volume stop: {}: success", name))
            }
        },
        "delete" => match state.volumes.get(name).map(|v| v.started) {
            None => fail(1, format!("volume delete: {}: failed: Volume {} does not exist", name, name)),
            Some(true) => fail(
                1,
                format!(
                    "volume delete: {}: failed: Volume {} has been started.Volume needs to be stopped before deletion.",
                    name, name
                ),
            ),
            Some(false) => {
                state.volumes.remove(name);
                ok(format!("volume delete: {}: success", name))
            }
        },
        "replace-brick" => {
            let [old, new, ..] = rest else {
                return fail(1, "Usage: volume replace-brick <VOLNAME> <SOURCE-BRICK> <NEW-BRICK> commit force");
            };
            if !brick_exists(state, new) {
                return fail(1, format!("volume replace-brick: failed: brick {} does not exist", new));
            }
            if state.volumes.values().any(|v| v.bricks.contains(new)) {
                return fail(1, format!("volume replace-brick: failed: {} is already part of a volume", new));
            }
            let Some(volume) = state.volumes.get_mut(name) else {
                return fail(1, format!("volume replace-brick: failed: Volume {} does not exist", name));
            };
            match volume.bricks.iter().position(|b| b == old) {
                Some(idx) => {
                    volume.bricks[idx] = new.clone();
                    ok("volume replace-brick: success: replace-brick commit force operation successful")
                }
                None => fail(
                    1,
                    format!("volume replace-brick: failed: brick: {} does not exist in volume: {}", old, name),
                ),
            }
        }
        "info" => match state.volumes.get(name) {
            Some(v) => ok(volume_xml(name, v)),
            None => volume_missing_xml(name),
        },
        _ => fail(1, format!("gluster: unknown volume command {}", sub)),
    }
}

// =============================================================================
// gluster-block
// =============================================================================

fn gluster_block(state: &mut FakeState, args: &[String]) -> CmdResult {
    let (Some(sub), Some(target)) = (args.first(), args.get(1)) else {
        return fail_json(1, "gluster-block: missing arguments");
    };
    let rest = &args[2..];

    match sub.as_str() {
        "create" => {
            let Some((hosting, name)) = target.split_once('/') else {
                return fail_json(1, "create: expected <volname>/<blockname>");
            };
            if !state.volumes.get(hosting).is_some_and(|v| v.started) {
                return fail_json(2, format!("volume {} does not exist or is not started", hosting));
            }
            if state.blocks.contains_key(target) {
                return fail_json(17, format!("BLOCK with name: '{}' already EXIST", name));
            }
            let pos = positional(rest, &[]);
            // ha N auth X prealloc Y hosts size
            let (Some(hosts), Some(size)) = (pos.get(6), pos.get(7).and_then(|s| gib(s))) else {
                return fail_json(1, "create: bad arguments");
            };
            let auth = pos.get(3).is_some_and(|a| *a == "enable");
            let hosts: Vec<String> = hosts.split(',').map(str::to_string).collect();
            let gbid = crate::model::new_id();
            let (username, password) = if auth {
                (gbid.clone(), format!("pw-{}", &gbid[..8]))
            } else {
                (String::new(), String::new())
            };
            let reply = json!({
                "IQN": format!("iqn.2016-12.org.gluster-block:{}", gbid),
                "USERNAME": username,
                "PASSWORD": password,
                "PORTAL(S)": hosts.iter().map(|h| format!("{}:3260", h)).collect::<Vec<_>>(),
                "RESULT": "SUCCESS",
            });
            state.blocks.insert(target.clone(), FakeBlock { gbid, size, hosts });
            ok(reply.to_string())
        }
        "delete" => match state.blocks.remove(target) {
            Some(block) => ok(json!({ "SUCCESSFUL ON": block.hosts, "RESULT": "SUCCESS" }).to_string()),
            None => fail_json(2, format!("block {} doesn't exist", target)),
        },
        "modify" => {
            let Some(new_size) = rest
                .iter()
                .position(|a| a == "size")
                .and_then(|i| rest.get(i + 1))
                .and_then(|s| gib(s))
            else {
                return fail_json(1, "modify: bad arguments");
            };
            let Some(block) = state.blocks.get_mut(target) else {
                return fail_json(2, format!("block {} doesn't exist", target));
            };
            if new_size < block.size {
                return fail_json(1, "shrinking a block volume is not supported");
            }
            block.size = new_size;
            ok(json!({
                "IQN": format!("iqn.2016-12.org.gluster-block:{}", block.gbid),
                "SIZE": format!("{}.0 GiB", new_size),
                "SUCCESSFUL ON": block.hosts,
                "RESULT": "SUCCESS",
            })
            .to_string())
        }
        "info" => match state.blocks.get(target) {
            Some(block) => {
                let (hosting, name) = target.split_once('/').unwrap_or(("", target));
                ok(json!({
                    "NAME": name,
                    "VOLUME": hosting,
                    "GBID": block.gbid,
                    "SIZE": format!("{}.0 GiB", block.size),
                    "HA": block.hosts.len(),
                    "PASSWORD": "",
                    "EXPORTED ON": block.hosts,
                })
                .to_string())
            }
            None => fail_json(2, format!("block {} doesn't exist", target)),
        },
        "list" => {
            let prefix = format!("{}/", target);
            let blocks: Vec<&str> = state
                .blocks
                .keys()
                .filter_map(|k| k.strip_prefix(&prefix))
                .collect();
            ok(json!({ "blocks": blocks, "RESULT": "SUCCESS" }).to_string())
        }
        other => fail_json(1, format!("unknown gluster-block command {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    async fn run(fake: &FakeCluster, host: &str, lines: &[&str]) -> Vec<CmdResult> {
        let cmds: Vec<Cmd> = lines.iter().map(|l| Cmd::new(*l)).collect();
        fake.exec_commands(host, &cmds, MINUTE).await.unwrap()
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("echo \"/dev/vg/lv /mnt xfs rw 1 2\" >> /etc/fstab"),
            vec!["echo", "/dev/vg/lv /mnt xfs rw 1 2", ">>", "/etc/fstab"]
        );
        assert_eq!(tokenize("pvcreate '/dev/sdb'"), vec!["pvcreate", "/dev/sdb"]);
    }

    #[tokio::test]
    async fn test_lvm_lifecycle() {
        let fake = FakeCluster::new();
        fake.add_host("h1");
        fake.add_disk("h1", "/dev/sdb", 10 * 1024 * 1024);

        let results = run(
            &fake,
            "h1",
            &[
                "pvcreate -qq '/dev/sdb'",
                "vgcreate -qq vg_d '/dev/sdb'",
                "lvcreate -qq --poolmetadatasize 8192K --chunksize 256K --size 1024K --thin vg_d/tp_b --virtualsize 1024K --name brick_b",
                "lvs --noheadings --options=thin_count vg_d/tp_b",
            ],
        )
        .await;
        assert!(results.iter().all(CmdResult::is_ok), "{results:?}");
        assert_eq!(results[3].output.trim(), "1");
        assert_eq!(fake.allocated(), 1024 + 8192);

        // pool cannot go before its thin volume
        let results = run(&fake, "h1", &["lvremove -f vg_d/tp_b"]).await;
        assert!(!results[0].is_ok());

        let results = run(&fake, "h1", &["lvremove -f vg_d/brick_b", "lvremove -f vg_d/tp_b"]).await;
        assert!(results.iter().all(CmdResult::is_ok));
        assert_eq!(fake.allocated(), 0);

        let results = run(&fake, "h1", &["lvremove -f vg_d/brick_b"]).await;
        assert!(results[0].err_output.contains("Failed to find logical volume"));
    }

    #[tokio::test]
    async fn test_umount_twice() {
        let fake = FakeCluster::new();
        fake.add_host("h1");
        fake.add_disk("h1", "/dev/sdb", 10 * 1024 * 1024);
        let results = run(
            &fake,
            "h1",
            &[
                "pvcreate /dev/sdb",
                "vgcreate vg /dev/sdb",
                "lvcreate --poolmetadatasize 4K --size 4K --thin vg/tp --virtualsize 4K --name lv",
                "mkfs.xfs /dev/vg/lv",
                "mkdir -p /mnt/lv",
                "mount -o rw /dev/vg/lv /mnt/lv",
                "mkdir /mnt/lv/brick",
                "umount /mnt/lv",
            ],
        )
        .await;
        assert!(results.iter().all(CmdResult::is_ok), "{results:?}");
        let results = run(&fake, "h1", &["umount /mnt/lv"]).await;
        assert!(results[0].err_output.contains("not mounted"));
        let results = run(&fake, "h1", &["rmdir /mnt/lv"]).await;
        assert!(results[0].is_ok());
    }

    #[tokio::test]
    async fn test_unknown_host() {
        let fake = FakeCluster::new();
        let err = fake
            .exec_commands("nowhere", &[Cmd::new("mkdir /x")], MINUTE)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_block_lifecycle() {
        let fake = FakeCluster::new();
        fake.add_host("h1");
        {
            let mut state = fake.state.lock();
            state.volumes.insert(
                "hv".into(),
                FakeVolume {
                    id: "x".into(),
                    replica: 3,
                    started: true,
                    bricks: vec![],
                },
            );
        }
        let results = run(
            &fake,
            "h1",
            &[
                "gluster-block create hv/b1 ha 3 auth disable prealloc full h1,h2,h3 1GiB --json",
                "gluster-block modify hv/b1 size 2GiB --json",
                "gluster-block info hv/b1 --json",
            ],
        )
        .await;
        assert!(results.iter().all(CmdResult::is_ok), "{results:?}");
        assert!(results[2].output.contains("\"SIZE\":\"2.0 GiB\""));
        assert_eq!(fake.block_volume_size("hv", "b1"), Some(2));

        let results = run(&fake, "h1", &["gluster-block delete hv/nope --json"]).await;
        assert!(results[0].output.contains("doesn't exist"));
    }
}
