use std::{net::IpAddr, sync::Arc};

use edge_resolver_core::{strip_root_dot, Point, Site};
use edge_resolver_forward::{reply_with_code, Forwarder};
use edge_resolver_index::{LocalServiceSet, ServiceTable};
use trust_dns_proto::{
    op::{Message, Query, ResponseCode},
    rr::{DNSClass, Name, RData, Record, RecordType},
};

use crate::{loc, Handler, Request};

/// Answers carry a zero TTL: service placement moves with the federation,
/// so clients must not cache it.
const ANSWER_TTL: u32 = 0;

/// The per-query resolution state machine.
///
/// Filter, annotation, local hit, table hit, forward, fallthrough, in that
/// order; see the crate docs.
pub struct Pipeline {
    site: Site,
    base_domain: Name,
    ignored: Vec<Name>,
    local: Arc<LocalServiceSet>,
    table: Arc<ServiceTable>,
    forwarder: Arc<Forwarder>,
    annotation: Record,
    next: Option<Arc<dyn Handler>>,
}

// === impl Pipeline ===

impl Pipeline {
    pub fn new(
        site: Site,
        base_domain: &str,
        ignored: &[String],
        local: Arc<LocalServiceSet>,
        table: Arc<ServiceTable>,
        forwarder: Arc<Forwarder>,
        next: Option<Arc<dyn Handler>>,
    ) -> anyhow::Result<Self> {
        let base_domain = Name::from_ascii(base_domain)?.to_lowercase();
        let ignored = ignored
            .iter()
            .map(|name| Ok(Name::from_ascii(name)?.to_lowercase()))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let annotation = loc::annotation_record(&site.coords)?;
        Ok(Self {
            site,
            base_domain,
            ignored,
            local,
            table,
            forwarder,
            annotation,
            next,
        })
    }

    fn matches(&self, name: &Name) -> bool {
        self.base_domain.zone_of(name) && !self.ignored.iter().any(|ignored| ignored.zone_of(name))
    }

    async fn next(&self, request: &mut Request) -> anyhow::Result<Message> {
        match &self.next {
            Some(next) => next.handle(request).await,
            None => Ok(reply_with_code(&request.message, ResponseCode::ServFail)),
        }
    }

    /// Builds the authoritative single-record answer. A query whose type
    /// does not fit the site's address family gets an empty NoError answer.
    fn answer(&self, request: &Message, query: &Query, ip: IpAddr) -> Message {
        let mut reply = reply_with_code(request, ResponseCode::NoError);
        let rdata = match (query.query_type(), ip) {
            (RecordType::A, IpAddr::V4(addr)) => Some(RData::A(addr)),
            (RecordType::AAAA, IpAddr::V6(addr)) => Some(RData::AAAA(addr)),
            _ => None,
        };
        if let Some(rdata) = rdata {
            let mut record = Record::from_rdata(query.name().clone(), ANSWER_TTL, rdata);
            record.set_dns_class(DNSClass::IN);
            reply.add_answer(record);
        }
        reply
    }
}

#[async_trait::async_trait]
impl Handler for Pipeline {
    async fn handle(&self, request: &mut Request) -> anyhow::Result<Message> {
        let query = match request.message.queries().first() {
            Some(query) => query.clone(),
            None => return Ok(reply_with_code(&request.message, ResponseCode::FormErr)),
        };
        let name = query.name().to_lowercase();

        if !self.matches(&name) {
            return self.next(request).await;
        }

        // A trailing annotation marks the query as forwarded by a
        // downstream hop; its absence marks it as client-originated.
        let origin = loc::extract_annotation(&mut request.message);

        let fqdn = name.to_ascii();
        let service = strip_root_dot(&fqdn);

        if origin.is_none() && self.local.contains(service) {
            tracing::debug!(service, "answering from the local service set");
            return Ok(self.answer(&request.message, &query, self.site.ip));
        }

        if let Some(sites) = self.table.lookup(service) {
            let reference = origin.unwrap_or(self.site.coords);
            if let Some(closest) = nearest_site(&sites, &reference) {
                tracing::debug!(service, site = %closest, "answering from the service table");
                return Ok(self.answer(&request.message, &query, closest.ip));
            }
        }

        if !self.forwarder.is_empty() {
            let mut outbound = request.message.clone();
            loc::annotate(&mut outbound, self.annotation.clone());
            tracing::debug!(service, "forwarding upstream");
            let reply = self.forwarder.forward(&outbound, request.proto).await?;
            return Ok(reply);
        }

        self.next(request).await
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("site", &self.site)
            .field("base_domain", &self.base_domain)
            .finish_non_exhaustive()
    }
}

/// The closest site to `reference`; ties go to the lowest IP so repeated
/// queries resolve deterministically.
pub(crate) fn nearest_site(sites: &[Site], reference: &Point) -> Option<Site> {
    let mut best: Option<(Site, f64)> = None;
    for site in sites {
        let km = reference.great_circle_km(&site.coords);
        let better = match &best {
            None => true,
            Some((incumbent, best_km)) => {
                km < *best_km || (km == *best_km && site.ip < incumbent.ip)
            }
        };
        if better {
            best = Some((*site, km));
        }
    }
    best.map(|(site, _)| site)
}
