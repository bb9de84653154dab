use std::collections::HashMap;

use crate::flow::{Endpoint, FlowAggregate};

/// Read-only lookup of finished flows by endpoint.
///
/// Every flow is filed under its source and its destination endpoint, since
/// the side recorded as "source" need not be the HTTP client. Buckets keep
/// insertion order. The index never changes after [`FlowIndex::build`], so
/// it can be shared across matcher threads.
#[derive(Debug, Default)]
pub struct FlowIndex {
    flows: Vec<FlowAggregate>,
    buckets: HashMap<Endpoint, Vec<usize>>,
}

impl FlowIndex {
    pub fn build(flows: Vec<FlowAggregate>) -> Self {
        let mut buckets: HashMap<Endpoint, Vec<usize>> = HashMap::new();
        for (i, flow) in flows.iter().enumerate() {
            let (src, dst) = (flow.source(), flow.destination());
            buckets.entry(src).or_default().push(i);
            // a land flow on one port would otherwise be filed twice
            if dst != src {
                buckets.entry(dst).or_default().push(i);
            }
        }
        FlowIndex { flows, buckets }
    }

    /// Candidate flows touching `endpoint`, in insertion order.
    pub fn candidates(&self, endpoint: &Endpoint) -> impl Iterator<Item = &FlowAggregate> {
        self.buckets
            .get(endpoint)
            .into_iter()
            .flatten()
            .map(|&i| &self.flows[i])
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PROTO_TCP, Packet};
    use chrono::{TimeZone, Utc};
    use std::net::{IpAddr, Ipv4Addr};

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn flow(src: (u8, u16), dst: (u8, u16), start: i64) -> FlowAggregate {
        FlowAggregate::from_packet(&Packet::ip(
            Utc.timestamp_opt(start, 0).unwrap(),
            ip(src.0),
            src.1,
            ip(dst.0),
            dst.1,
            PROTO_TCP,
            60,
        ))
        .unwrap()
    }

    #[test]
    fn test_flow_filed_under_both_endpoints() {
        let index = FlowIndex::build(vec![flow((1, 80), (5, 1234), 10)]);
        let client = Endpoint::new(ip(5), 1234);
        let server = Endpoint::new(ip(1), 80);
        assert_eq!(index.candidates(&client).count(), 1);
        assert_eq!(index.candidates(&server).count(), 1);
        assert_eq!(index.candidates(&Endpoint::new(ip(5), 1235)).count(), 0);
    }

    #[test]
    fn test_candidates_keep_insertion_order() {
        let index = FlowIndex::build(vec![
            flow((5, 1234), (1, 80), 30),
            flow((7, 4000), (1, 443), 5),
            flow((1, 8080), (5, 1234), 20),
        ]);
        let starts: Vec<i64> = index
            .candidates(&Endpoint::new(ip(5), 1234))
            .map(|f| f.start_time.timestamp())
            .collect();
        assert_eq!(starts, vec![30, 20]);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_land_flow_filed_once() {
        let index = FlowIndex::build(vec![flow((5, 7), (5, 7), 1)]);
        assert_eq!(index.candidates(&Endpoint::new(ip(5), 7)).count(), 1);
    }
}
