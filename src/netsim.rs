//! Simulated RPC middleware and traffic accounting
//!
//! Nothing here moves bytes: the "network" is a registry of RPC endpoint
//! codes plus per-channel counters. Every remote invocation in the
//! protocols is a synchronous function call that first records one request
//! transmission and, unless the method is one-way, one response
//! transmission on the corresponding channels.
//!
//! ## Endpoint codes
//!
//! An RPC code packs `[interface | method·2 | response-bit]`: interface
//! `i` owns the code `(i+1) << 16`, its method `m` the code
//! `ifc | (m+1)·2`, and the response channel of a method sets the low bit.
//! Request and response of one method therefore differ only in that bit.
//!
//! ## TCP cost model
//!
//! Channels charge a per-transmission overhead of
//! `40·⌈bytes/1024⌉` on top of the payload, resembling TCP segment
//! headers; `tcp_bytes` accumulates payload plus overhead.

use std::collections::HashMap;

use crate::records::SourceId;

/// An RPC endpoint code.
pub type Rpcc = u32;

/// Bit position where interface codes start.
pub const RPCC_BITS_PER_IFC: u32 = 16;
/// Mask of the method bits.
pub const RPCC_METH_MASK: Rpcc = (1 << RPCC_BITS_PER_IFC) - 2;
/// The response bit.
pub const RPCC_RESP_MASK: Rpcc = 1;

/// Per-transmission header overhead, in bytes.
pub const TCP_HEADER_BYTES: usize = 40;
/// Segment size of the TCP cost model.
pub const TCP_MSS: usize = 1024;

/// Errors of the RPC registry.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("empty interface or method name")]
    EmptyName,
    #[error("too many methods in interface")]
    TooManyMethods,
    #[error("method {0} redeclared with a different one-way flag")]
    OnewayMismatch(String),
}

/// A declared RPC method.
#[derive(Debug, Clone)]
pub struct RpcMethod {
    pub rpcc: Rpcc,
    pub name: String,
    pub one_way: bool,
}

impl RpcMethod {
    /// The code of this method's response channel.
    pub fn response_code(&self) -> Rpcc {
        self.rpcc | RPCC_RESP_MASK
    }
}

/// A declared RPC interface with its methods.
#[derive(Debug, Clone, Default)]
pub struct RpcInterface {
    pub rpcc: Rpcc,
    pub name: String,
    methods: Vec<RpcMethod>,
    by_name: HashMap<String, usize>,
}

impl RpcInterface {
    fn declare(&mut self, mname: &str, one_way: bool) -> Result<Rpcc, NetError> {
        if mname.is_empty() {
            return Err(NetError::EmptyName);
        }
        if let Some(&ix) = self.by_name.get(mname) {
            let m = &self.methods[ix];
            if m.one_way != one_way {
                return Err(NetError::OnewayMismatch(mname.to_string()));
            }
            return Ok(m.rpcc);
        }
        if ((self.methods.len() + 1) << 1) as Rpcc > RPCC_METH_MASK {
            return Err(NetError::TooManyMethods);
        }
        let rpcc = self.rpcc | (((self.methods.len() + 1) as Rpcc) << 1);
        self.by_name.insert(mname.to_string(), self.methods.len());
        self.methods.push(RpcMethod { rpcc, name: mname.to_string(), one_way });
        Ok(rpcc)
    }

    /// Look up a method by its code (response bit ignored).
    pub fn method(&self, rpcc: Rpcc) -> Option<&RpcMethod> {
        let ix = ((rpcc & RPCC_METH_MASK) >> 1) as usize;
        ix.checked_sub(1).and_then(|i| self.methods.get(i))
    }

    /// All declared methods.
    pub fn methods(&self) -> &[RpcMethod] {
        &self.methods
    }
}

/// The registry of interfaces and their endpoint codes for one network.
#[derive(Debug, Clone, Default)]
pub struct RpcProtocol {
    /// Human-readable protocol name, used in result rows.
    pub name: String,
    ifaces: Vec<RpcInterface>,
    by_name: HashMap<String, usize>,
}

impl RpcProtocol {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }

    /// Declare (or look up) an interface by name.
    pub fn declare_interface(&mut self, name: &str) -> Result<Rpcc, NetError> {
        if name.is_empty() {
            return Err(NetError::EmptyName);
        }
        if let Some(&ix) = self.by_name.get(name) {
            return Ok(self.ifaces[ix].rpcc);
        }
        let rpcc = ((self.ifaces.len() + 1) as Rpcc) << RPCC_BITS_PER_IFC;
        self.by_name.insert(name.to_string(), self.ifaces.len());
        self.ifaces.push(RpcInterface {
            rpcc,
            name: name.to_string(),
            ..Default::default()
        });
        Ok(rpcc)
    }

    /// Declare (or look up) a method on an interface.
    pub fn declare_method(&mut self, ifc: Rpcc, mname: &str, one_way: bool) -> Result<Rpcc, NetError> {
        let ix = (ifc >> RPCC_BITS_PER_IFC) as usize - 1;
        self.ifaces[ix].declare(mname, one_way)
    }

    /// Find a method by code.
    pub fn method(&self, rpcc: Rpcc) -> Option<&RpcMethod> {
        let ix = (rpcc >> RPCC_BITS_PER_IFC) as usize;
        ix.checked_sub(1).and_then(|i| self.ifaces.get(i)).and_then(|ifc| ifc.method(rpcc))
    }

    /// Find a method code by interface and method name.
    pub fn lookup(&self, ifc: &str, mname: &str) -> Option<Rpcc> {
        let &ix = self.by_name.get(ifc)?;
        let iface = &self.ifaces[ix];
        let &mix = iface.by_name.get(mname)?;
        Some(iface.methods[mix].rpcc)
    }
}

/// Host addresses of the star topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostAddr {
    /// The central coordinator (hub).
    Coordinator,
    /// A site, by its source id.
    Site(SourceId),
}

/// One unidirectional channel's counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelStats {
    pub msgs: usize,
    pub bytes: usize,
    pub tcp_bytes: usize,
}

impl ChannelStats {
    fn transmit(&mut self, msg_size: usize) {
        self.msgs += 1;
        self.bytes += msg_size;
        self.tcp_bytes += msg_size + TCP_HEADER_BYTES * msg_size.div_ceil(TCP_MSS);
    }
}

/// A fully resolved remote method: request code plus the response code for
/// two-way methods.
#[derive(Debug, Clone, Copy)]
pub struct MethodCode {
    pub req: Rpcc,
    pub resp: Option<Rpcc>,
}

/// The channel table of one simulated network; channels are created on
/// first use, keyed by `(src, dst, endpoint)`.
#[derive(Debug, Default)]
pub struct Traffic {
    channels: HashMap<(HostAddr, HostAddr, Rpcc), ChannelStats>,
}

impl Traffic {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one transmission of `bytes` on `(src, dst, rpcc)`.
    pub fn transmit(&mut self, src: HostAddr, dst: HostAddr, rpcc: Rpcc, bytes: usize) {
        self.channels.entry((src, dst, rpcc)).or_default().transmit(bytes);
    }

    /// Account one remote invocation: a request of `req_bytes` from `src`
    /// to `dst` and, for two-way methods, a response of `resp_bytes` back.
    pub fn call(
        &mut self,
        src: HostAddr,
        dst: HostAddr,
        mc: MethodCode,
        req_bytes: usize,
        resp_bytes: usize,
    ) {
        self.transmit(src, dst, mc.req, req_bytes);
        if let Some(resp) = mc.resp {
            self.transmit(dst, src, resp, resp_bytes);
        }
    }

    /// The stats of one channel, if it has carried traffic.
    pub fn channel(&self, src: HostAddr, dst: HostAddr, rpcc: Rpcc) -> Option<&ChannelStats> {
        self.channels.get(&(src, dst, rpcc))
    }

    /// Sum a statistic over all channels matching `pred`.
    pub fn tally(
        &self,
        mut pred: impl FnMut(&(HostAddr, HostAddr, Rpcc), &ChannelStats) -> bool,
        stat: impl Fn(&ChannelStats) -> usize,
    ) -> usize {
        self.channels
            .iter()
            .filter(|(k, v)| pred(k, v))
            .map(|(_, v)| stat(v))
            .sum()
    }

    /// Total messages over all channels.
    pub fn total_msgs(&self) -> usize {
        self.tally(|_, _| true, |c| c.msgs)
    }

    /// Total payload bytes over all channels.
    pub fn total_bytes(&self) -> usize {
        self.tally(|_, _| true, |c| c.bytes)
    }

    /// Total TCP-model bytes over all channels.
    pub fn total_tcp_bytes(&self) -> usize {
        self.tally(|_, _| true, |c| c.tcp_bytes)
    }

    /// Bytes carried on the endpoint `rpcc` (over all host pairs).
    pub fn bytes_for_endpoint(&self, rpcc: Rpcc) -> usize {
        self.tally(|&(_, _, c), _| c == rpcc, |c| c.bytes)
    }

    /// Iterate over all channels.
    pub fn iter(&self) -> impl Iterator<Item = (&(HostAddr, HostAddr, Rpcc), &ChannelStats)> {
        self.channels.iter()
    }
}

/// Declare a two-way method on `proto`, returning both endpoint codes.
pub fn declare_method(proto: &mut RpcProtocol, ifc: &str, mname: &str) -> MethodCode {
    let i = proto.declare_interface(ifc).expect("interface declaration");
    let req = proto.declare_method(i, mname, false).expect("method declaration");
    MethodCode { req, resp: Some(req | RPCC_RESP_MASK) }
}

/// Declare a one-way method on `proto`.
pub fn declare_oneway(proto: &mut RpcProtocol, ifc: &str, mname: &str) -> MethodCode {
    let i = proto.declare_interface(ifc).expect("interface declaration");
    let req = proto.declare_method(i, mname, true).expect("method declaration");
    MethodCode { req, resp: None }
}

// ---------------------------------------------------------------------------
// Byte sizing of payloads
// ---------------------------------------------------------------------------

/// Transmission size of a payload value. State vectors travel as 4-byte
/// floats.
pub trait ByteSize {
    fn byte_size(&self) -> usize;
}

impl ByteSize for () {
    fn byte_size(&self) -> usize {
        0
    }
}

impl ByteSize for f32 {
    fn byte_size(&self) -> usize {
        4
    }
}

impl ByteSize for f64 {
    fn byte_size(&self) -> usize {
        8
    }
}

impl ByteSize for i32 {
    fn byte_size(&self) -> usize {
        4
    }
}

impl ByteSize for usize {
    fn byte_size(&self) -> usize {
        8
    }
}

impl ByteSize for [f64] {
    fn byte_size(&self) -> usize {
        4 * self.len()
    }
}

impl ByteSize for Vec<f64> {
    fn byte_size(&self) -> usize {
        4 * self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_codes_are_unique_and_idempotent() {
        let mut p = RpcProtocol::new("test");
        let site = p.declare_interface("site").unwrap();
        let coord = p.declare_interface("coord").unwrap();
        assert_ne!(site, coord);
        assert_eq!(p.declare_interface("site").unwrap(), site);

        let reset = p.declare_method(site, "reset", true).unwrap();
        let drift = p.declare_method(site, "get_drift", false).unwrap();
        let lv = p.declare_method(coord, "local_violation", true).unwrap();
        assert_ne!(reset, drift);
        assert_ne!(reset & !RPCC_RESP_MASK, lv & !RPCC_RESP_MASK);
        assert_eq!(p.declare_method(site, "reset", true).unwrap(), reset);

        // request and response differ only in the response bit
        let m = p.method(drift).unwrap();
        assert_eq!(m.response_code(), drift | 1);
        assert_eq!(m.response_code() & !RPCC_RESP_MASK, drift);

        assert!(matches!(
            p.declare_method(site, "reset", false),
            Err(NetError::OnewayMismatch(_))
        ));
        assert_eq!(p.lookup("site", "get_drift"), Some(drift));
    }

    #[test]
    fn channels_are_created_once_per_key() {
        let mut t = Traffic::new();
        let a = HostAddr::Site(1);
        let b = HostAddr::Coordinator;
        t.transmit(a, b, 42, 100);
        t.transmit(a, b, 42, 50);
        t.transmit(b, a, 42, 10);

        let c = t.channel(a, b, 42).unwrap();
        assert_eq!(c.msgs, 2);
        assert_eq!(c.bytes, 150);
        assert_eq!(t.channel(b, a, 42).unwrap().msgs, 1);
        assert_eq!(t.total_msgs(), 3);
    }

    #[test]
    fn tcp_accounting_charges_header_per_segment() {
        let mut t = Traffic::new();
        let a = HostAddr::Site(3);
        let b = HostAddr::Coordinator;

        // single transmission: tcp = bytes + 40·ceil(bytes/1024)
        for &bytes in &[1usize, 1024, 1025, 4096, 10_000] {
            let mut t1 = Traffic::new();
            t1.transmit(a, b, 7, bytes);
            let c = *t1.channel(a, b, 7).unwrap();
            assert_eq!(c.tcp_bytes, bytes + 40 * bytes.div_ceil(1024), "bytes={bytes}");
        }

        // zero-byte messages still count as messages, not traffic
        t.transmit(a, b, 7, 0);
        let c = t.channel(a, b, 7).unwrap();
        assert_eq!((c.msgs, c.bytes, c.tcp_bytes), (1, 0, 0));
    }

    #[test]
    fn two_way_calls_account_request_and_response() {
        let mut p = RpcProtocol::new("test");
        let mc = declare_method(&mut p, "site", "get_drift");
        let ow = declare_oneway(&mut p, "coord", "local_violation");

        let mut t = Traffic::new();
        let s = HostAddr::Site(2);
        t.call(HostAddr::Coordinator, s, mc, 16, 4000);
        t.call(s, HostAddr::Coordinator, ow, 4, 0);

        assert_eq!(t.channel(HostAddr::Coordinator, s, mc.req).unwrap().bytes, 16);
        assert_eq!(t.channel(s, HostAddr::Coordinator, mc.resp.unwrap()).unwrap().bytes, 4000);
        assert_eq!(t.bytes_for_endpoint(mc.resp.unwrap()), 4000);
        // one-way: no response channel was created
        assert!(t.channel(HostAddr::Coordinator, s, ow.req | RPCC_RESP_MASK).is_none());
    }

    #[test]
    fn byte_sizes_follow_float_wire_format() {
        let v = vec![0.0f64; 10];
        assert_eq!(v.byte_size(), 40);
        assert_eq!(().byte_size(), 0);
        assert_eq!(1.0f32.byte_size(), 4);
    }
}
