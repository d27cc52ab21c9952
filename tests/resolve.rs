//! End-to-end resolution over a scripted upstream.
//!
//! The dispatch engine is synchronous, so a test can stand in for the whole
//! network: drain the worker's outbound queue, answer each exchange from a
//! scripted delegation tree, and feed the replies back until the worker
//! goes quiet.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{
    rdata::{A, CNAME, NS, SOA},
    Name, RData, Record, RecordType,
};

use kodiak_dns::error::ErrorKind;
use kodiak_dns::module::OutboundRequest;
use kodiak_dns::worker::ClientHandle;
use kodiak_dns::{Config, ModuleEnv, RuntimeConfig, TrustAnchorStore, Worker};

const ROOT_SERVER: &str = "198.41.0.4";
const COM_SERVER: &str = "192.0.2.10";
const EXAMPLE_SERVER: &str = "192.0.2.20";

fn name(s: &str) -> Name {
    Name::from_str(s).unwrap()
}

fn a_rr(owner: &str, ttl: u32, ip: [u8; 4]) -> Record {
    Record::from_rdata(name(owner), ttl, RData::A(A::new(ip[0], ip[1], ip[2], ip[3])))
}

fn ns_rr(owner: &str, target: &str) -> Record {
    Record::from_rdata(name(owner), 86_400, RData::NS(NS(name(target))))
}

fn cname_rr(owner: &str, target: &str) -> Record {
    Record::from_rdata(name(owner), 300, RData::CNAME(CNAME(name(target))))
}

fn soa_rr(zone: &str) -> Record {
    Record::from_rdata(
        name(zone),
        3_600,
        RData::SOA(SOA::new(
            name(&format!("ns.{}", zone.trim_start_matches('.'))),
            name(&format!("hostmaster.{}", zone.trim_start_matches('.'))),
            1,
            7_200,
            3_600,
            86_400,
            300,
        )),
    )
}

fn response_to(request: &OutboundRequest) -> Message {
    let mut message = Message::new();
    message
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_response_code(ResponseCode::NoError);
    let mut query = Query::query(request.qinfo.qname.clone(), request.qinfo.qtype);
    query.set_query_class(request.qinfo.qclass);
    message.add_query(query);
    message
}

/// The scripted delegation tree: root → com → example.com, with an extra
/// CNAME at cname.example.com and a NODATA name.
fn scripted_upstream(request: &OutboundRequest) -> Option<Message> {
    let target = request.target.ip().to_string();
    let qname = request.qinfo.qname.to_string().to_lowercase();
    let qtype = request.qinfo.qtype;
    let mut message = response_to(request);

    // priming: any root hint answers the root NS set with glue
    if qname == "." && qtype == RecordType::NS {
        message.set_authoritative(true);
        message.add_answer(ns_rr(".", "a.root-servers.net."));
        message.add_additional(a_rr("a.root-servers.net.", 518_400, [198, 41, 0, 4]));
        return Some(message);
    }

    if target == ROOT_SERVER {
        // the root refers everything under com. downward
        if qname.ends_with("com.") {
            message.add_name_server(ns_rr("com.", "ns.com."));
            message.add_additional(a_rr("ns.com.", 172_800, [192, 0, 2, 10]));
        } else {
            message.set_response_code(ResponseCode::NXDomain);
            message.set_authoritative(true);
            message.add_name_server(soa_rr("."));
        }
        return Some(message);
    }

    if target == COM_SERVER {
        message.add_name_server(ns_rr("example.com.", "ns.example.com."));
        message.add_additional(a_rr("ns.example.com.", 172_800, [192, 0, 2, 20]));
        return Some(message);
    }

    if target == EXAMPLE_SERVER {
        message.set_authoritative(true);
        match (qname.as_str(), qtype) {
            ("www.example.com.", RecordType::A) => {
                message.add_answer(a_rr("www.example.com.", 300, [192, 0, 2, 99]));
            }
            ("cname.example.com.", RecordType::A) => {
                message.add_answer(cname_rr("cname.example.com.", "www.example.com."));
            }
            ("empty.example.com.", _) => {
                message.add_name_server(soa_rr("example.com."));
            }
            ("ns.example.com.", RecordType::A) => {
                message.add_answer(a_rr("ns.example.com.", 172_800, [192, 0, 2, 20]));
            }
            _ => {
                message.set_response_code(ResponseCode::NXDomain);
                message.add_name_server(soa_rr("example.com."));
            }
        }
        return Some(message);
    }

    None
}

fn test_env(config: Config) -> Arc<ModuleEnv> {
    let cfg = Arc::new(RuntimeConfig::from_config(config).unwrap());
    let anchors = Arc::new(TrustAnchorStore::from_runtime_config(&cfg).unwrap());
    Arc::new(ModuleEnv::new(cfg, anchors))
}

fn client_query(qname: &str, qtype: RecordType) -> Message {
    let mut message = Message::new();
    message
        .set_id(4242)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    message.add_query(Query::query(name(qname), qtype));
    message
}

fn udp_client() -> ClientHandle {
    ClientHandle::Udp {
        addr: "203.0.113.5:40000".parse().unwrap(),
        socket: 0,
    }
}

/// Feed scripted answers until the worker has nothing left to send.
/// Returns the number of outbound exchanges that were performed.
fn drive(worker: &mut Worker, now: u64) -> usize {
    let mut exchanges = 0;
    loop {
        let outbound = worker.take_outbound();
        if outbound.is_empty() {
            return exchanges;
        }
        for (qid, request) in outbound {
            exchanges += 1;
            match scripted_upstream(&request) {
                Some(message) => worker.handle_outbound_result(qid, Ok(message), Some(40), now),
                None => worker.handle_outbound_result(
                    qid,
                    Err(ErrorKind::Timeout.into()),
                    None,
                    now,
                ),
            }
        }
    }
}

fn answered_ips(message: &Message) -> Vec<SocketAddr> {
    message
        .answers()
        .iter()
        .filter_map(|r| r.data().as_a().map(|a| SocketAddr::new(a.0.into(), 0)))
        .collect()
}

#[test]
fn cold_cache_walks_the_delegation_tree() {
    let env = test_env(Config::default());
    let mut worker = Worker::new(env);

    worker.handle_client_query(&client_query("www.example.com.", RecordType::A), udp_client(), 1_000, 1_000_000);
    let exchanges = drive(&mut worker, 1_000);

    let responses = worker.take_responses();
    assert_eq!(responses.len(), 1);
    let message = &responses[0].message;
    assert_eq!(message.response_code(), ResponseCode::NoError);
    assert_eq!(
        answered_ips(message),
        vec!["192.0.2.99:0".parse().unwrap()]
    );
    // priming plus one query per delegation level
    assert_eq!(exchanges, 4);
    assert_eq!(worker.active_queries(), 0);
}

#[test]
fn second_query_is_served_from_cache_with_aged_ttl() {
    let env = test_env(Config::default());
    let mut worker = Worker::new(env);

    worker.handle_client_query(&client_query("www.example.com.", RecordType::A), udp_client(), 1_000, 1_000_000);
    drive(&mut worker, 1_000);
    worker.take_responses();

    // 100 seconds later the same question costs no network traffic
    worker.handle_client_query(&client_query("www.example.com.", RecordType::A), udp_client(), 1_100, 1_100_000);
    let exchanges = drive(&mut worker, 1_100);
    assert_eq!(exchanges, 0);

    let responses = worker.take_responses();
    assert_eq!(responses.len(), 1);
    let answer = &responses[0].message.answers()[0];
    assert_eq!(answer.ttl(), 200);
}

#[test]
fn cname_is_chased_to_the_target() {
    let env = test_env(Config::default());
    let mut worker = Worker::new(env);

    worker.handle_client_query(&client_query("cname.example.com.", RecordType::A), udp_client(), 1_000, 1_000_000);
    drive(&mut worker, 1_000);

    let responses = worker.take_responses();
    assert_eq!(responses.len(), 1);
    let message = &responses[0].message;
    assert_eq!(message.response_code(), ResponseCode::NoError);
    let has_cname = message
        .answers()
        .iter()
        .any(|r| r.record_type() == RecordType::CNAME);
    let has_a = message
        .answers()
        .iter()
        .any(|r| r.data().as_a().is_some());
    assert!(has_cname && has_a, "answer carries the chain and its target");
}

#[test]
fn nodata_and_nxdomain_are_negative_answers() {
    let env = test_env(Config::default());
    let mut worker = Worker::new(env);

    worker.handle_client_query(&client_query("empty.example.com.", RecordType::A), udp_client(), 1_000, 1_000_000);
    drive(&mut worker, 1_000);
    let responses = worker.take_responses();
    assert_eq!(responses[0].message.response_code(), ResponseCode::NoError);
    assert!(responses[0].message.answers().is_empty());

    worker.handle_client_query(&client_query("missing.example.com.", RecordType::A), udp_client(), 1_000, 1_000_000);
    drive(&mut worker, 1_000);
    let responses = worker.take_responses();
    assert_eq!(responses[0].message.response_code(), ResponseCode::NXDomain);
}

#[test]
fn unreachable_servers_exhaust_to_servfail() {
    let mut config = Config::default();
    // a forwarder that the scripted upstream never answers
    config.forward_zone = vec![kodiak_dns::config::ForwardZone {
        name: "dead.example.".to_string(),
        forward_addr: vec!["192.0.2.250:53".parse().unwrap()],
    }];
    let env = test_env(config);
    let mut worker = Worker::new(env);

    worker.handle_client_query(&client_query("host.dead.example.", RecordType::A), udp_client(), 1_000, 1_000_000);
    let exchanges = drive(&mut worker, 1_000);

    let responses = worker.take_responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].message.response_code(), ResponseCode::ServFail);
    // one target, bounded retries
    assert!(exchanges <= 4, "retry budget respected, saw {exchanges}");
}

#[test]
fn unsigned_answer_under_a_trust_anchor_is_bogus() {
    let mut config = Config::default();
    config.trust_anchor = vec![
        "example.com. IN DS 20326 8 2 E06D44B80B8F1D39A95C0B0D7C65D08458E880409BBC683457104237C7F8EC8D"
            .to_string(),
    ];
    let env = test_env(config);
    let mut worker = Worker::new(env);

    worker.handle_client_query(&client_query("www.example.com.", RecordType::A), udp_client(), 1_000, 1_000_000);
    drive(&mut worker, 1_000);
    let responses = worker.take_responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].message.response_code(), ResponseCode::ServFail);

    // the bogus verdict is cached: the retry costs no exchanges and still fails
    worker.handle_client_query(&client_query("www.example.com.", RecordType::A), udp_client(), 1_010, 1_010_000);
    let exchanges = drive(&mut worker, 1_010);
    assert_eq!(exchanges, 0);
    let responses = worker.take_responses();
    assert_eq!(responses[0].message.response_code(), ResponseCode::ServFail);
}

#[test]
fn checking_disabled_skips_validation() {
    let mut config = Config::default();
    config.trust_anchor = vec![
        "example.com. IN DS 20326 8 2 E06D44B80B8F1D39A95C0B0D7C65D08458E880409BBC683457104237C7F8EC8D"
            .to_string(),
    ];
    let env = test_env(config);
    let mut worker = Worker::new(env);

    let mut query = client_query("www.example.com.", RecordType::A);
    query.set_checking_disabled(true);
    worker.handle_client_query(&query, udp_client(), 1_000, 1_000_000);
    drive(&mut worker, 1_000);

    let responses = worker.take_responses();
    assert_eq!(responses.len(), 1);
    let message = &responses[0].message;
    assert_eq!(message.response_code(), ResponseCode::NoError);
    assert!(!message.answers().is_empty());
    assert!(!message.header().authentic_data());
}

#[test]
fn permissive_mode_serves_the_answer_anyway() {
    let mut config = Config::default();
    config.val_permissive_mode = true;
    config.trust_anchor = vec![
        "example.com. IN DS 20326 8 2 E06D44B80B8F1D39A95C0B0D7C65D08458E880409BBC683457104237C7F8EC8D"
            .to_string(),
    ];
    let env = test_env(config);
    let mut worker = Worker::new(env);

    worker.handle_client_query(&client_query("www.example.com.", RecordType::A), udp_client(), 1_000, 1_000_000);
    drive(&mut worker, 1_000);
    let responses = worker.take_responses();
    assert_eq!(responses.len(), 1);
    let message = &responses[0].message;
    assert_eq!(message.response_code(), ResponseCode::NoError);
    assert!(!message.answers().is_empty());
    assert!(!message.header().authentic_data());
}
