//! Endpoint ID wire form: `[scheme, ssp]`, where ipn SSPs are `[node,
//! service]` and the only dtn-scheme endpoint is `dtn:none` (SSP `0`).

use crate::codec::cbor::{Reader, Writer};
use crate::codec::types::{EndpointId, IpnAddress};
use crate::error::{BpError, BpResult};

const SCHEME_DTN: u64 = 1;
const SCHEME_IPN: u64 = 2;

pub fn encode_eid(w: &mut Writer, eid: &EndpointId) -> BpResult<()> {
    match eid {
        EndpointId::Undefined => Err(BpError::Codec("undefined endpoint scheme")),
        EndpointId::DtnNone => {
            w.array(2);
            w.uint(SCHEME_DTN);
            w.uint(0);
            Ok(())
        }
        EndpointId::Ipn(addr) => {
            w.array(2);
            w.uint(SCHEME_IPN);
            w.array(2);
            w.uint(addr.node);
            w.uint(addr.service);
            Ok(())
        }
    }
}

pub fn decode_eid(r: &mut Reader<'_>) -> BpResult<EndpointId> {
    if r.array()? != 2 {
        return Err(BpError::Codec("endpoint ID must be a 2-array"));
    }
    match r.uint()? {
        SCHEME_DTN => {
            if r.uint()? != 0 {
                return Err(BpError::Codec("only dtn:none is supported"));
            }
            Ok(EndpointId::DtnNone)
        }
        SCHEME_IPN => {
            if r.array()? != 2 {
                return Err(BpError::Codec("ipn SSP must be a 2-array"));
            }
            let node = r.uint()?;
            let service = r.uint()?;
            Ok(EndpointId::Ipn(IpnAddress::new(node, service)))
        }
        _ => Err(BpError::Codec("unknown EID scheme")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipn_wire_form() {
        let mut w = Writer::new();
        encode_eid(&mut w, &EndpointId::ipn(200, 1)).unwrap();
        assert_eq!(w.as_slice(), &[0x82, 0x02, 0x82, 0x18, 0xC8, 0x01]);
        let mut r = Reader::new(w.as_slice());
        assert_eq!(decode_eid(&mut r).unwrap(), EndpointId::ipn(200, 1));
    }

    #[test]
    fn dtn_none_wire_form() {
        let mut w = Writer::new();
        encode_eid(&mut w, &EndpointId::DtnNone).unwrap();
        assert_eq!(w.as_slice(), &[0x82, 0x01, 0x00]);
        let mut r = Reader::new(w.as_slice());
        assert_eq!(decode_eid(&mut r).unwrap(), EndpointId::DtnNone);
    }

    #[test]
    fn undefined_scheme_refuses_to_encode() {
        let mut w = Writer::new();
        assert!(encode_eid(&mut w, &EndpointId::Undefined).is_err());
    }

    #[test]
    fn unknown_scheme_refuses_to_decode() {
        let mut r = Reader::new(&[0x82, 0x03, 0x00]);
        assert!(decode_eid(&mut r).is_err());
    }
}
