//! Generic-netlink taskstats client.
//!
//! One datagram socket per agent, opened at startup. The family id is
//! discovered once with `CTRL_CMD_GETFAMILY`; after that every per-PID query
//! is a single hand-built 28-byte request and a fixed-offset decode of the
//! reply. Frames are laid out manually; a structural decoder would pay
//! reflection-style overhead on every PID every interval.

use std::os::unix::io::RawFd;

use tracing::warn;

use crate::error::CollectError;
use crate::model::{now_ns, DelayCounters};

const NLMSG_HDRLEN: usize = 16;
const GENL_HDRLEN: usize = 4;
const ATTR_HDRLEN: usize = 4;

const NLMSG_ERROR: u16 = 0x2;

const NLM_F_REQUEST: u16 = 0x1;

const GENL_ID_CTRL: u16 = 0x10;
const CTRL_CMD_GETFAMILY: u8 = 0x3;
const CTRL_ATTR_FAMILY_ID: u16 = 0x1;
const CTRL_ATTR_FAMILY_NAME: u16 = 0x2;

const TASKSTATS_GENL_NAME: &[u8] = b"TASKSTATS\0";
const TASKSTATS_GENL_VERSION: u8 = 0x1;
const TASKSTATS_CMD_GET: u8 = 0x1;
const TASKSTATS_CMD_ATTR_PID: u16 = 0x1;

/// Per-PID request frame: nl header (16) + genl header (4) + one attribute (8).
const PID_REQUEST_LEN: usize = 28;

/// Send/receive scratch size. Taskstats replies fit comfortably.
const SCRATCH_LEN: usize = 4096;

/// Fixed offsets into `struct taskstats` (payload of TASKSTATS_TYPE_STATS).
/// version(2) pad(2) exitcode(4) flag(1) nice(1) pad(6), then 8-byte counters.
/// These break if the kernel struct ever changes shape.
mod off {
    pub const CPU_DELAY_COUNT: usize = 16;
    pub const CPU_DELAY_TOTAL: usize = 24;
    pub const BLKIO_DELAY_COUNT: usize = 32;
    pub const BLKIO_DELAY_TOTAL: usize = 40;
    pub const SWAPIN_DELAY_COUNT: usize = 48;
    pub const SWAPIN_DELAY_TOTAL: usize = 56;
    pub const PID: usize = 128;
    pub const NVCSW: usize = 272;
    pub const NIVCSW: usize = 280;
    pub const FREEPAGES_DELAY_COUNT: usize = 312;
    pub const FREEPAGES_DELAY_TOTAL: usize = 320;

    /// Everything we read lies below this.
    pub const STATS_MIN_LEN: usize = 328;
}

/// Offset of the taskstats struct within a reply datagram:
/// nl header + genl header + AGGR_PID attr + PID attr + pid value + STATS attr.
const STATS_PAYLOAD_OFFSET: usize =
    NLMSG_HDRLEN + GENL_HDRLEN + ATTR_HDRLEN + ATTR_HDRLEN + 4 + ATTR_HDRLEN;

#[inline]
fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&data[offset..offset + 2]);
    u16::from_le_bytes(raw)
}

#[inline]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

#[inline]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

/// Builds the 28-byte per-PID taskstats request.
///
/// ```text
///   off  0: nl header  (len=28, type=family_id, flags=REQUEST, seq, pid=agent)
///   off 16: genl header (cmd=TASKSTATS_CMD_GET, version)
///   off 20: attribute  (len=8, type=CMD_ATTR_PID, value=target_pid)
/// ```
pub fn build_pid_request(
    family_id: u16,
    seq: u32,
    agent_pid: u32,
    target_pid: u32,
) -> [u8; PID_REQUEST_LEN] {
    let mut buf = [0u8; PID_REQUEST_LEN];
    buf[0..4].copy_from_slice(&(PID_REQUEST_LEN as u32).to_le_bytes());
    buf[4..6].copy_from_slice(&family_id.to_le_bytes());
    buf[6..8].copy_from_slice(&NLM_F_REQUEST.to_le_bytes());
    buf[8..12].copy_from_slice(&seq.to_le_bytes());
    buf[12..16].copy_from_slice(&agent_pid.to_le_bytes());
    buf[16] = TASKSTATS_CMD_GET;
    buf[17] = TASKSTATS_GENL_VERSION;
    // genl reserved u16 stays zero.
    buf[20..22].copy_from_slice(&8u16.to_le_bytes());
    buf[22..24].copy_from_slice(&TASKSTATS_CMD_ATTR_PID.to_le_bytes());
    buf[24..28].copy_from_slice(&target_pid.to_le_bytes());
    buf
}

/// Builds the family-discovery request carrying `FAMILY_NAME="TASKSTATS"`.
pub fn build_family_request(seq: u32, agent_pid: u32) -> Vec<u8> {
    let name_attr_len = ATTR_HDRLEN + TASKSTATS_GENL_NAME.len(); // 14
    let padded = (name_attr_len + 3) & !3; // 16
    let total = NLMSG_HDRLEN + GENL_HDRLEN + padded;

    let mut buf = vec![0u8; total];
    buf[0..4].copy_from_slice(&(total as u32).to_le_bytes());
    buf[4..6].copy_from_slice(&GENL_ID_CTRL.to_le_bytes());
    buf[6..8].copy_from_slice(&NLM_F_REQUEST.to_le_bytes());
    buf[8..12].copy_from_slice(&seq.to_le_bytes());
    buf[12..16].copy_from_slice(&agent_pid.to_le_bytes());
    buf[16] = CTRL_CMD_GETFAMILY;
    buf[17] = TASKSTATS_GENL_VERSION;
    buf[20..22].copy_from_slice(&(name_attr_len as u16).to_le_bytes());
    buf[22..24].copy_from_slice(&CTRL_ATTR_FAMILY_NAME.to_le_bytes());
    buf[24..24 + TASKSTATS_GENL_NAME.len()].copy_from_slice(TASKSTATS_GENL_NAME);
    buf
}

/// Extracts the dynamically assigned family id from a GETFAMILY reply by
/// walking the attribute list.
pub fn parse_family_reply(data: &[u8]) -> Result<u16, CollectError> {
    if data.len() < NLMSG_HDRLEN + GENL_HDRLEN {
        return Err(CollectError::Protocol { what: "short family reply" });
    }

    if read_u16_le(data, 4) == NLMSG_ERROR {
        return Err(CollectError::fatal("netlink error during family discovery"));
    }

    let mut pos = NLMSG_HDRLEN + GENL_HDRLEN;
    while pos + ATTR_HDRLEN <= data.len() {
        let attr_len = read_u16_le(data, pos) as usize;
        let attr_type = read_u16_le(data, pos + 2);

        if attr_len < ATTR_HDRLEN || pos + attr_len > data.len() {
            break;
        }

        if attr_type == CTRL_ATTR_FAMILY_ID && attr_len >= ATTR_HDRLEN + 2 {
            return Ok(read_u16_le(data, pos + ATTR_HDRLEN));
        }

        pos += (attr_len + 3) & !3;
    }

    Err(CollectError::Protocol { what: "family id attribute missing" })
}

/// Decodes a per-PID reply into `out`.
///
/// An `NLMSG_ERROR` with errno -1 means the agent lacks the privileges
/// taskstats requires and is fatal; any other errno marks this PID's delay
/// block absent for the interval. The embedded tgid is cross-checked against
/// the requested PID and logged on mismatch, never fatal.
pub fn parse_pid_reply(
    data: &[u8],
    requested_pid: u32,
    out: &mut DelayCounters,
) -> Result<(), CollectError> {
    if data.len() < NLMSG_HDRLEN + 4 {
        return Err(CollectError::Protocol { what: "short taskstats reply" });
    }

    if read_u16_le(data, 4) == NLMSG_ERROR {
        // struct nlmsgerr: i32 error followed by the echoed header.
        let errno = read_u32_le(data, NLMSG_HDRLEN) as i32;
        if errno == -1 {
            return Err(CollectError::fatal(
                "netlink EPERM: taskstats requires root (CAP_NET_ADMIN)",
            ));
        }
        return Err(CollectError::TaskstatsUnavailable {
            pid: requested_pid,
            errno,
        });
    }

    let stats = data
        .get(STATS_PAYLOAD_OFFSET..)
        .filter(|s| s.len() >= off::STATS_MIN_LEN)
        .ok_or(CollectError::Protocol { what: "truncated taskstats payload" })?;

    let embedded_pid = read_u32_le(stats, off::PID);
    if embedded_pid != requested_pid {
        warn!(requested_pid, embedded_pid, "taskstats reply for unexpected pid");
    }

    out.capture_time_ns = now_ns();
    out.cpu_delay_count = read_u64_le(stats, off::CPU_DELAY_COUNT);
    out.cpu_delay_total_ns = read_u64_le(stats, off::CPU_DELAY_TOTAL);
    out.blkio_delay_count = read_u64_le(stats, off::BLKIO_DELAY_COUNT);
    out.blkio_delay_total_ns = read_u64_le(stats, off::BLKIO_DELAY_TOTAL);
    out.swapin_delay_count = read_u64_le(stats, off::SWAPIN_DELAY_COUNT);
    out.swapin_delay_total_ns = read_u64_le(stats, off::SWAPIN_DELAY_TOTAL);
    out.nvcsw = read_u64_le(stats, off::NVCSW);
    out.nivcsw = read_u64_le(stats, off::NIVCSW);
    out.freepages_delay_count = read_u64_le(stats, off::FREEPAGES_DELAY_COUNT);
    out.freepages_delay_total_ns = read_u64_le(stats, off::FREEPAGES_DELAY_TOTAL);

    Ok(())
}

/// The agent's taskstats socket. Used only from the sampler thread.
pub struct TaskstatsConn {
    fd: RawFd,
    family_id: u16,
    agent_pid: u32,
    seq: u32,
    scratch: Box<[u8; SCRATCH_LEN]>,
}

impl TaskstatsConn {
    /// Opens the generic-netlink socket, binds it to the agent pid, and
    /// discovers the taskstats family id. Any failure here is fatal.
    pub fn open() -> Result<Self, CollectError> {
        let agent_pid = std::process::id();

        // Safety: plain socket(2) call; the fd is owned by the returned
        // struct and closed on drop.
        let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, libc::NETLINK_GENERIC) };
        if fd < 0 {
            return Err(CollectError::fatal(format!(
                "opening netlink socket: {}",
                std::io::Error::last_os_error(),
            )));
        }

        // Safety: addr is a fully initialized sockaddr_nl on the stack.
        let bound = unsafe {
            let mut addr: libc::sockaddr_nl = std::mem::zeroed();
            addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
            addr.nl_pid = agent_pid;
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if bound < 0 {
            let err = std::io::Error::last_os_error();
            // Safety: fd is open and not yet shared.
            unsafe { libc::close(fd) };
            return Err(CollectError::fatal(format!("binding netlink socket: {err}")));
        }

        let mut conn = Self {
            fd,
            family_id: 0,
            agent_pid,
            seq: 0,
            scratch: Box::new([0u8; SCRATCH_LEN]),
        };

        conn.discover_family()?;
        Ok(conn)
    }

    fn discover_family(&mut self) -> Result<(), CollectError> {
        self.seq = self.seq.wrapping_add(1);
        let request = build_family_request(self.seq, self.agent_pid);
        self.send(&request)?;
        let len = self.recv()?;
        let family = parse_family_reply(&self.scratch[..len])?;
        self.family_id = family;
        Ok(())
    }

    /// Queries delay counters for one PID, writing into `out` on success.
    pub fn lookup(&mut self, pid: u32, out: &mut DelayCounters) -> Result<(), CollectError> {
        self.seq = self.seq.wrapping_add(1);
        let request = build_pid_request(self.family_id, self.seq, self.agent_pid, pid);
        self.send(&request)?;
        let len = self.recv()?;
        parse_pid_reply(&self.scratch[..len], pid, out)
    }

    pub fn family_id(&self) -> u16 {
        self.family_id
    }

    fn send(&self, data: &[u8]) -> Result<(), CollectError> {
        // Safety: data is a valid readable slice for its length.
        let n = unsafe { libc::send(self.fd, data.as_ptr().cast(), data.len(), 0) };
        if n < 0 {
            return Err(CollectError::fatal(format!(
                "netlink send: {}",
                std::io::Error::last_os_error(),
            )));
        }
        Ok(())
    }

    fn recv(&mut self) -> Result<usize, CollectError> {
        // Safety: scratch is a valid writable buffer of SCRATCH_LEN bytes.
        let n = unsafe {
            libc::recv(
                self.fd,
                self.scratch.as_mut_ptr().cast(),
                SCRATCH_LEN,
                0,
            )
        };
        if n < 0 {
            return Err(CollectError::fatal(format!(
                "netlink recv: {}",
                std::io::Error::last_os_error(),
            )));
        }
        Ok(n as usize)
    }
}

impl Drop for TaskstatsConn {
    fn drop(&mut self) {
        // Safety: fd was opened by us and is closed exactly once.
        unsafe { libc::close(self.fd) };
    }
}
