//! Record -> row rendering.
//!
//! All display strings derived from a raw record are computed here once
//! per row and handed to the column formatters; CSV quoting and the field
//! formatting rules (bare hex for registers and hashes, single quotes for
//! text that may contain commas) live here and nowhere else.

use taskcap_common::{state, ConnInfo, IorqCompletion, SyscallCompletion, TaskSample};
use taskcap_common::{TSF_MIGRATION_PENDING, TSF_ON_CPU, TSF_ON_RQ};

use crate::timebase::TimeBase;

/// One sample with every derived display string precomputed.
pub struct SampleRow {
    pub timestamp: String,
    pub weight_us: u64,
    pub tid: u32,
    pub tgid: u32,
    pub pidns: u32,
    pub cgroup_id: u64,
    pub state: String,
    pub username: String,
    pub exe: String,
    pub comm: String,
    pub syscall: String,
    pub syscall_active: String,
    pub sysc_entry_time: String,
    pub sysc_ns_so_far: u64,
    pub sysc_seq_num: u64,
    pub iorq_seq_num: u64,
    pub args: [u64; 6],
    pub filename: String,
    pub connection: String,
    pub conn_state: String,
    pub extra_info: String,
    pub kstack_hash: u64,
    pub ustack_hash: u64,
}

/// Build the display row for one sample. `username` is resolved by the
/// caller so this function stays free of cache borrows.
#[must_use]
pub fn build_sample_row(
    rec: &TaskSample,
    base: &TimeBase,
    weight_us: u64,
    username: String,
) -> SampleRow {
    let sysc_ns_so_far = if rec.active_syscall_nr >= 0 && rec.sc_enter_time > 0 {
        rec.sample_actual_ktime.saturating_sub(rec.sc_enter_time)
    } else {
        0
    };
    SampleRow {
        timestamp: base.wall_from_ktime(rec.sample_start_ktime).local().iso8601(),
        weight_us,
        tid: rec.tid,
        tgid: rec.tgid,
        pidns: rec.pidns_id,
        cgroup_id: rec.cgroup_id,
        state: state_string(rec.state, rec.flags),
        username,
        exe: fixed_str(&rec.exe),
        comm: fixed_str(&rec.comm),
        syscall: syscall_name(rec.syscall_nr),
        syscall_active: syscall_name(rec.active_syscall_nr),
        sysc_entry_time: if rec.sc_enter_time > 0 {
            base.wall_from_ktime(rec.sc_enter_time).local().iso8601()
        } else {
            String::new()
        },
        sysc_ns_so_far,
        sysc_seq_num: rec.sc_sequence_num,
        iorq_seq_num: rec.iorq_sequence_num,
        args: rec.syscall_args,
        filename: fixed_str(&rec.filename),
        connection: connection_string(&rec.conn),
        conn_state: tcp_state_name(rec.conn.protocol, rec.conn.tcp_state).to_string(),
        extra_info: extra_info_json(rec),
        kstack_hash: rec.kstack_hash,
        ustack_hash: rec.ustack_hash,
    }
}

/// State mnemonic plus the runqueue/migration suffixes.
#[must_use]
pub fn state_string(state_bits: u32, flags: u32) -> String {
    let mut s = state::state_label(state_bits).to_string();
    if flags & TSF_ON_RQ != 0 && flags & TSF_ON_CPU == 0 {
        s.push('Q');
    }
    if flags & TSF_MIGRATION_PENDING != 0 {
        s.push('M');
    }
    s
}

/// NUL-terminated fixed-size kernel string to owned text.
#[must_use]
pub fn fixed_str(buf: &[u8]) -> String {
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

/// Syscall nr to name; negative means "not in a syscall".
#[must_use]
pub fn syscall_name(nr: i32) -> String {
    if nr < 0 {
        return String::new();
    }
    syscall_numbers::native::sys_call_name(i64::from(nr))
        .map_or_else(|| nr.to_string(), ToString::to_string)
}

const TCP_STATES: [&str; 13] = [
    "",
    "ESTABLISHED",
    "SYN_SENT",
    "SYN_RECV",
    "FIN_WAIT1",
    "FIN_WAIT2",
    "TIME_WAIT",
    "CLOSE",
    "CLOSE_WAIT",
    "LAST_ACK",
    "LISTEN",
    "CLOSING",
    "NEW_SYN_RECV",
];

#[must_use]
pub fn tcp_state_name(protocol: u8, tcp_state: u8) -> &'static str {
    if protocol != libc::IPPROTO_TCP as u8 {
        return "";
    }
    TCP_STATES.get(tcp_state as usize).copied().unwrap_or("")
}

/// `local->remote` endpoint string, empty when the fd was not an inet
/// socket.
#[must_use]
pub fn connection_string(conn: &ConnInfo) -> String {
    match i32::from(conn.family) {
        libc::AF_INET => {
            let l = std::net::Ipv4Addr::from([
                conn.local_addr[0],
                conn.local_addr[1],
                conn.local_addr[2],
                conn.local_addr[3],
            ]);
            let r = std::net::Ipv4Addr::from([
                conn.remote_addr[0],
                conn.remote_addr[1],
                conn.remote_addr[2],
                conn.remote_addr[3],
            ]);
            format!("{l}:{}->{r}:{}", conn.local_port, conn.remote_port)
        }
        libc::AF_INET6 => {
            let l = std::net::Ipv6Addr::from(conn.local_addr);
            let r = std::net::Ipv6Addr::from(conn.remote_addr);
            format!("[{l}]:{}->[{r}]:{}", conn.local_port, conn.remote_port)
        }
        _ => String::new(),
    }
}

/// Extension fields as a compact JSON object, empty when nothing applies.
#[must_use]
pub fn extra_info_json(rec: &TaskSample) -> String {
    let mut obj = serde_json::Map::new();
    if rec.aio_inflight > 0 {
        obj.insert("aio_inflight".into(), rec.aio_inflight.into());
    }
    if rec.uring_sq_pending > 0 || rec.uring_cq_pending > 0 {
        obj.insert("uring_sq_pending".into(), rec.uring_sq_pending.into());
        obj.insert("uring_cq_pending".into(), rec.uring_cq_pending.into());
    }
    if rec.uring_opcode > 0 || rec.uring_len > 0 {
        obj.insert("uring_opcode".into(), rec.uring_opcode.into());
        obj.insert("uring_offset".into(), rec.uring_offset.into());
        obj.insert("uring_len".into(), rec.uring_len.into());
    }
    if obj.is_empty() {
        String::new()
    } else {
        serde_json::Value::Object(obj).to_string()
    }
}

/// Quote a CSV text field with single quotes. Embedded quotes and line
/// breaks would break the row format, so they degrade to underscores.
#[must_use]
pub fn csv_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        out.push(match c {
            '\'' | '\n' | '\r' => '_',
            c => c,
        });
    }
    out.push('\'');
    out
}

/// Decode raw REQ_OP | REQ_* bits to `READ|SYNC|META` style text.
/// Bit positions from the block layer's blk_types.h.
#[must_use]
pub fn iorq_flags_string(cmd_flags: u32) -> String {
    const OPS: [(u32, &str); 7] = [
        (0, "READ"),
        (1, "WRITE"),
        (2, "FLUSH"),
        (3, "DISCARD"),
        (5, "SECURE_ERASE"),
        (7, "ZONE_APPEND"),
        (9, "WRITE_ZEROES"),
    ];
    const FLAGS: [(u32, &str); 9] = [
        (1 << 11, "SYNC"),
        (1 << 12, "META"),
        (1 << 13, "PRIO"),
        (1 << 14, "NOMERGE"),
        (1 << 15, "IDLE"),
        (1 << 17, "FUA"),
        (1 << 18, "PREFLUSH"),
        (1 << 19, "RAHEAD"),
        (1 << 21, "NOWAIT"),
    ];

    let op = cmd_flags & 0xff;
    let mut parts: Vec<&str> =
        vec![OPS.iter().find(|(v, _)| *v == op).map_or("OP_UNKNOWN", |(_, name)| name)];
    for (bit, name) in FLAGS {
        if cmd_flags & bit != 0 {
            parts.push(name);
        }
    }
    parts.join("|")
}

/// Syscall-completion CSV row (`SC_COMPLETION_HEADER` order).
#[must_use]
pub fn sc_completion_row(rec: &SyscallCompletion, base: &TimeBase) -> String {
    let duration = rec.exit_time.saturating_sub(rec.enter_time);
    format!(
        "SYSC,{},{},{},{},{},{},{}",
        rec.tid,
        rec.tgid,
        csv_text(&syscall_name(rec.syscall_nr)),
        duration,
        rec.ret,
        rec.sc_sequence_num,
        base.wall_from_ktime(rec.enter_time).local().iso8601(),
    )
}

/// Block-I/O-completion CSV row (`IORQ_COMPLETION_HEADER` order).
#[must_use]
pub fn iorq_completion_row(rec: &IorqCompletion, base: &TimeBase) -> String {
    let duration = rec.complete_time.saturating_sub(rec.insert_time);
    let service = rec.complete_time.saturating_sub(rec.issue_time);
    let queued = rec.issue_time.saturating_sub(rec.insert_time);
    format!(
        "IORQ,{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
        rec.insert_tid,
        rec.insert_tgid,
        rec.issue_tid,
        rec.issue_tgid,
        rec.complete_tid,
        rec.complete_tgid,
        rec.dev >> 20,
        rec.dev & 0xfffff,
        rec.sector,
        rec.bytes,
        csv_text(&iorq_flags_string(rec.cmd_flags)),
        rec.iorq_sequence_num,
        duration,
        service,
        queued,
        base.wall_from_ktime(rec.issue_time).local().iso8601(),
        rec.error,
    )
}

/// Stack CSV row: bare-hex hash, quoted semicolon-joined symbols.
#[must_use]
pub fn stack_row(hash: u64, syms: &str) -> String {
    format!("{hash:x},{}", csv_text(syms))
}

/// Cgroup CSV row.
#[must_use]
pub fn cgroup_row(cgroup_id: u64, path: &str) -> String {
    format!("{cgroup_id},{}", csv_text(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskcap_common::{EVENT_IORQ_COMPLETION, EVENT_SYSCALL_COMPLETION};

    fn base() -> TimeBase {
        // basis: mono 0 == epoch 0, so ktime ns map straight onto wall ns
        TimeBase::fixed(0, 0)
    }

    #[test]
    fn state_suffixes() {
        use taskcap_common::state::TASK_RUNNING;
        assert_eq!(state_string(TASK_RUNNING, TSF_ON_RQ), "RUNQ");
        assert_eq!(state_string(TASK_RUNNING, TSF_ON_RQ | TSF_ON_CPU), "RUN");
        assert_eq!(
            state_string(TASK_RUNNING, TSF_ON_RQ | TSF_MIGRATION_PENDING),
            "RUNQM"
        );
    }

    #[test]
    fn fixed_str_stops_at_nul() {
        let mut buf = [0u8; 16];
        buf[..4].copy_from_slice(b"comm");
        assert_eq!(fixed_str(&buf), "comm");
        let full = [b'x'; 16];
        assert_eq!(fixed_str(&full).len(), 16);
    }

    #[test]
    fn syscall_names_resolve() {
        // nr 0 is read on x86_64 and io_setup on aarch64; either way a name exists
        assert!(!syscall_name(0).is_empty());
        assert_eq!(syscall_name(-1), "");
    }

    #[test]
    fn connection_v4_format() {
        let mut conn = ConnInfo {
            family: 2, // AF_INET
            protocol: 6,
            tcp_state: 1,
            local_port: 38422,
            remote_port: 5432,
            ..Default::default()
        };
        conn.local_addr[..4].copy_from_slice(&[10, 0, 0, 5]);
        conn.remote_addr[..4].copy_from_slice(&[10, 0, 0, 9]);
        assert_eq!(connection_string(&conn), "10.0.0.5:38422->10.0.0.9:5432");
        assert_eq!(tcp_state_name(conn.protocol, conn.tcp_state), "ESTABLISHED");
    }

    #[test]
    fn udp_has_no_tcp_state() {
        assert_eq!(tcp_state_name(17, 1), "");
    }

    #[test]
    fn listen_state_name() {
        assert_eq!(tcp_state_name(6, 10), "LISTEN");
    }

    #[test]
    fn csv_text_quotes_and_sanitizes() {
        assert_eq!(csv_text("a,b"), "'a,b'");
        assert_eq!(csv_text("it's"), "'it_s'");
        assert_eq!(csv_text("two\nlines"), "'two_lines'");
    }

    #[test]
    fn iorq_flags_decode() {
        assert_eq!(iorq_flags_string(0), "READ");
        assert_eq!(iorq_flags_string(1 | (1 << 11) | (1 << 17)), "WRITE|SYNC|FUA");
        assert_eq!(iorq_flags_string(1 | (1 << 12)), "WRITE|META");
    }

    #[test]
    fn extra_info_empty_when_no_fields() {
        let rec = TaskSample::zeroed();
        assert_eq!(extra_info_json(&rec), "");
    }

    #[test]
    fn extra_info_carries_uring_occupancy() {
        let mut rec = TaskSample::zeroed();
        rec.uring_sq_pending = 3;
        let json: serde_json::Value = serde_json::from_str(&extra_info_json(&rec)).unwrap();
        assert_eq!(json["uring_sq_pending"], 3);
        assert_eq!(json["uring_cq_pending"], 0);
    }

    #[test]
    fn sc_completion_row_shape() {
        let rec = SyscallCompletion {
            kind: EVENT_SYSCALL_COMPLETION,
            tid: 100,
            tgid: 100,
            syscall_nr: 0,
            enter_time: 1_000_000_000,
            exit_time: 4_000_000_000,
            sc_sequence_num: 7,
            ret: 4096,
        };
        let row = sc_completion_row(&rec, &base());
        let fields: Vec<&str> = row.split(',').collect();
        assert_eq!(fields[0], "SYSC");
        assert_eq!(fields[1], "100");
        assert_eq!(fields[4], "3000000000"); // DURATION_NS
        assert_eq!(fields[5], "4096"); // SYSC_RET_VAL
        assert_eq!(fields[6], "7"); // SYSC_SEQ_NUM
    }

    #[test]
    fn iorq_completion_row_durations() {
        let rec = IorqCompletion {
            kind: EVENT_IORQ_COMPLETION,
            insert_tid: 1,
            insert_tgid: 1,
            issue_tid: 2,
            issue_tgid: 2,
            complete_tid: 3,
            complete_tgid: 3,
            dev: (259 << 20) | 2,
            sector: 123_456,
            iorq_sequence_num: 9,
            insert_time: 1_000,
            issue_time: 4_000,
            complete_time: 10_000,
            bytes: 8192,
            cmd_flags: 0,
            error: 0,
            _pad: 0,
        };
        let row = iorq_completion_row(&rec, &base());
        let fields: Vec<&str> = row.split(',').collect();
        assert_eq!(fields[0], "IORQ");
        assert_eq!(fields[7], "259"); // DEV_MAJ
        assert_eq!(fields[8], "2"); // DEV_MIN
        assert_eq!(fields[13], "9000"); // DURATION_NS
        assert_eq!(fields[14], "6000"); // SERVICE_NS
        assert_eq!(fields[15], "3000"); // QUEUED_NS
    }

    #[test]
    fn stack_row_hex_hash() {
        let row = stack_row(0xdead_beef, "vfs_read+0x80;ksys_read+0x5c");
        assert_eq!(row, "deadbeef,'vfs_read+0x80;ksys_read+0x5c'");
    }
}
