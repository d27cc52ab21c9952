//! Classification of upstream responses.

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::{Name, RecordType};

use crate::reply::QueryInfo;

/// What an upstream response means for the resolution in progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseType {
    /// The answer section resolves the chased query, possibly through a
    /// CNAME chain that ends in records of the right type
    Answer,
    /// The answer section only takes the chain further; the chase must
    /// restart at the CNAME target
    Cname,
    /// A delegation to another set of nameservers
    Referral,
    /// The name does not exist
    NxDomain,
    /// The name exists but has no records of this type
    NoData,
    /// The server does not serve the zone properly
    Lame,
    /// Useless response; try another target
    Throwaway,
}

/// Classify a response to the chased query.
///
/// The caller verifies message id and question matching; this looks only at
/// the semantics of the sections.
pub fn classify(message: &Message, qchase: &QueryInfo) -> ResponseType {
    if message.header().message_type() != MessageType::Response
        || message.header().op_code() != OpCode::Query
    {
        return ResponseType::Throwaway;
    }

    match message.response_code() {
        ResponseCode::NoError => {}
        ResponseCode::NXDomain => return ResponseType::NxDomain,
        ResponseCode::Refused | ResponseCode::NotImp => return ResponseType::Lame,
        ResponseCode::ServFail => return ResponseType::Lame,
        _ => return ResponseType::Throwaway,
    }

    // walk the answer section from the chased name through any CNAMEs
    let mut chase: Name = qchase.qname.clone();
    let mut followed = true;
    let mut saw_cname = false;
    while followed {
        followed = false;
        for record in message.answers() {
            if *record.name() != chase {
                continue;
            }
            if record.record_type() == qchase.qtype || qchase.qtype == RecordType::ANY {
                return ResponseType::Answer;
            }
            if record.record_type() == RecordType::CNAME && qchase.qtype != RecordType::CNAME {
                if let Some(cname) = record.data().as_cname() {
                    chase = cname.0.clone();
                    saw_cname = true;
                    followed = true;
                    break;
                }
            }
        }
    }
    if saw_cname {
        return ResponseType::Cname;
    }

    let mut has_ns = false;
    let mut has_soa = false;
    for record in message.name_servers() {
        match record.record_type() {
            RecordType::NS => has_ns = true,
            RecordType::SOA => has_soa = true,
            _ => {}
        }
    }
    if has_soa {
        // the SOA marks an authoritative empty answer
        return ResponseType::NoData;
    }
    if has_ns {
        return ResponseType::Referral;
    }
    ResponseType::Throwaway
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::{
        rdata::{A, CNAME, NS, SOA},
        RData, Record,
    };
    use std::str::FromStr;

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    fn response() -> Message {
        let mut message = Message::new();
        message
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_response_code(ResponseCode::NoError);
        message
    }

    fn qchase(qname: &str, qtype: RecordType) -> QueryInfo {
        QueryInfo::new(name(qname), qtype)
    }

    #[test]
    fn direct_answer() {
        let mut message = response();
        message.add_answer(Record::from_rdata(
            name("www.example.com."),
            60,
            RData::A(A::new(192, 0, 2, 1)),
        ));
        assert_eq!(
            classify(&message, &qchase("www.example.com.", RecordType::A)),
            ResponseType::Answer
        );
    }

    #[test]
    fn cname_with_final_answer_is_answer() {
        let mut message = response();
        message.add_answer(Record::from_rdata(
            name("www.example.com."),
            60,
            RData::CNAME(CNAME(name("target.example.com."))),
        ));
        message.add_answer(Record::from_rdata(
            name("target.example.com."),
            60,
            RData::A(A::new(192, 0, 2, 1)),
        ));
        assert_eq!(
            classify(&message, &qchase("www.example.com.", RecordType::A)),
            ResponseType::Answer
        );
    }

    #[test]
    fn dangling_cname_restarts_the_chase() {
        let mut message = response();
        message.add_answer(Record::from_rdata(
            name("www.example.com."),
            60,
            RData::CNAME(CNAME(name("target.elsewhere.net."))),
        ));
        assert_eq!(
            classify(&message, &qchase("www.example.com.", RecordType::A)),
            ResponseType::Cname
        );
    }

    #[test]
    fn referral_has_ns_without_soa() {
        let mut message = response();
        message.add_name_server(Record::from_rdata(
            name("example.com."),
            86400,
            RData::NS(NS(name("ns1.example.com."))),
        ));
        assert_eq!(
            classify(&message, &qchase("www.example.com.", RecordType::A)),
            ResponseType::Referral
        );
    }

    #[test]
    fn nodata_has_soa() {
        let mut message = response();
        message.add_name_server(Record::from_rdata(
            name("example.com."),
            3600,
            RData::SOA(SOA::new(
                name("ns1.example.com."),
                name("hostmaster.example.com."),
                1,
                7200,
                3600,
                86400,
                300,
            )),
        ));
        assert_eq!(
            classify(&message, &qchase("www.example.com.", RecordType::A)),
            ResponseType::NoData
        );
    }

    #[test]
    fn refused_is_lame_and_empty_is_throwaway() {
        let mut message = response();
        message.set_response_code(ResponseCode::Refused);
        assert_eq!(
            classify(&message, &qchase("www.example.com.", RecordType::A)),
            ResponseType::Lame
        );
        assert_eq!(
            classify(&response(), &qchase("www.example.com.", RecordType::A)),
            ResponseType::Throwaway
        );
    }
}
