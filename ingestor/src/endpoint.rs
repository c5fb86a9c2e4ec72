//! Registry of supported ingestion tasks.
//!
//! Each (source, data type) pair maps to exactly one [`Endpoint`]: where its
//! list pages live, how they are encoded and paginated, which filters the
//! remote understands, and which table and natural key its records land in.

use crate::model::{DataType, Filters, Source, TaskKey};
use crate::source::{JsonFormat, SourceFormat, XmlFormat};
use ingestor_core::{Error, Result};
use reqwest::Url;

#[derive(Debug, Clone, Copy)]
pub enum WireFormat {
    Json(JsonFormat),
    Xml(XmlFormat),
}

impl WireFormat {
    pub fn parser(&self) -> &dyn SourceFormat {
        match self {
            WireFormat::Json(format) => format as &dyn SourceFormat,
            WireFormat::Xml(format) => format as &dyn SourceFormat,
        }
    }
}

/// Remote query parameter name for each filter, `None` where the endpoint
/// has no equivalent.
#[derive(Debug, Clone, Copy)]
pub struct FilterParams {
    pub from: Option<&'static str>,
    pub to: Option<&'static str>,
    pub search: Option<&'static str>,
    pub party: Option<&'static str>,
    pub committee: Option<&'static str>,
    pub member_id: Option<&'static str>,
    pub doc_type: Option<&'static str>,
    pub riksmote: Option<&'static str>,
    pub category: Option<&'static str>,
}

const NO_FILTERS: FilterParams = FilterParams {
    from: None,
    to: None,
    search: None,
    party: None,
    committee: None,
    member_id: None,
    doc_type: None,
    riksmote: None,
    category: None,
};

#[derive(Debug)]
pub struct Endpoint {
    pub task: TaskKey,
    pub path: &'static str,
    pub format: WireFormat,
    pub page_param: &'static str,
    pub size_param: &'static str,
    pub fixed_params: &'static [(&'static str, &'static str)],
    pub filters: FilterParams,
    pub requires_category: bool,
    /// `false` for endpoints that return the whole collection in one response.
    pub paginated: bool,
    pub table: &'static str,
    pub natural_key: &'static str,
}

static ENDPOINTS: [Endpoint; 6] = [
    Endpoint {
        task: TaskKey {
            source: Source::Riksdagen,
            data_type: DataType::Documents,
        },
        path: "/dokumentlista/",
        format: WireFormat::Json(JsonFormat {
            root: "dokumentlista",
            item: "dokument",
            total_items: "@traffar",
            total_pages: Some("@sidor"),
            next_page: Some("@nasta_sida"),
        }),
        page_param: "p",
        size_param: "sz",
        fixed_params: &[("utformat", "json"), ("sort", "datum"), ("sortorder", "desc")],
        filters: FilterParams {
            from: Some("from"),
            to: Some("tom"),
            search: Some("sok"),
            party: Some("parti"),
            committee: Some("organ"),
            member_id: Some("iid"),
            doc_type: Some("doktyp"),
            riksmote: Some("rm"),
            category: None,
        },
        requires_category: false,
        paginated: true,
        table: "documents",
        natural_key: "dok_id",
    },
    Endpoint {
        task: TaskKey {
            source: Source::Riksdagen,
            data_type: DataType::Members,
        },
        path: "/personlista/",
        format: WireFormat::Json(JsonFormat {
            root: "personlista",
            item: "person",
            total_items: "@hits",
            total_pages: None,
            next_page: None,
        }),
        page_param: "p",
        size_param: "sz",
        fixed_params: &[("utformat", "json"), ("rdlstatus", "samtliga")],
        filters: FilterParams {
            party: Some("parti"),
            committee: Some("org"),
            member_id: Some("iid"),
            ..NO_FILTERS
        },
        requires_category: false,
        paginated: false,
        table: "members",
        natural_key: "intressent_id",
    },
    Endpoint {
        task: TaskKey {
            source: Source::Riksdagen,
            data_type: DataType::Speeches,
        },
        path: "/anforandelista/",
        format: WireFormat::Json(JsonFormat {
            root: "anforandelista",
            item: "anforande",
            total_items: "@antal",
            total_pages: None,
            next_page: None,
        }),
        page_param: "p",
        size_param: "sz",
        fixed_params: &[("utformat", "json")],
        filters: FilterParams {
            from: Some("d"),
            to: Some("ts"),
            party: Some("parti"),
            member_id: Some("iid"),
            riksmote: Some("rm"),
            ..NO_FILTERS
        },
        requires_category: false,
        paginated: true,
        table: "speeches",
        natural_key: "anforande_id",
    },
    Endpoint {
        task: TaskKey {
            source: Source::Riksdagen,
            data_type: DataType::Votes,
        },
        path: "/voteringlista/",
        format: WireFormat::Json(JsonFormat {
            root: "voteringlista",
            item: "votering",
            total_items: "@antal",
            total_pages: None,
            next_page: None,
        }),
        page_param: "p",
        size_param: "sz",
        fixed_params: &[("utformat", "json"), ("gruppering", "votering_id")],
        filters: FilterParams {
            search: Some("bet"),
            party: Some("parti"),
            member_id: Some("iid"),
            riksmote: Some("rm"),
            ..NO_FILTERS
        },
        requires_category: false,
        paginated: true,
        table: "votes",
        natural_key: "votering_id",
    },
    Endpoint {
        task: TaskKey {
            source: Source::Regeringen,
            data_type: DataType::PressReleases,
        },
        path: "/documents",
        format: WireFormat::Xml(XmlFormat {
            item: "item",
            total_items: "total",
            total_pages: Some("pages"),
            next_page: None,
        }),
        page_param: "page",
        size_param: "pageSize",
        fixed_params: &[("type", "pressmeddelanden"), ("format", "xml")],
        filters: FilterParams {
            from: Some("from"),
            to: Some("to"),
            search: Some("q"),
            committee: Some("department"),
            ..NO_FILTERS
        },
        requires_category: false,
        paginated: true,
        table: "press_releases",
        natural_key: "document_id",
    },
    Endpoint {
        task: TaskKey {
            source: Source::Regeringen,
            data_type: DataType::CategorizedDocuments,
        },
        path: "/documents",
        format: WireFormat::Xml(XmlFormat {
            item: "item",
            total_items: "total",
            total_pages: Some("pages"),
            next_page: None,
        }),
        page_param: "page",
        size_param: "pageSize",
        fixed_params: &[("format", "xml")],
        filters: FilterParams {
            from: Some("from"),
            to: Some("to"),
            search: Some("q"),
            committee: Some("department"),
            category: Some("type"),
            ..NO_FILTERS
        },
        requires_category: true,
        paginated: true,
        table: "government_documents",
        natural_key: "document_id",
    },
];

impl Endpoint {
    /// Looks up the endpoint for a task; unsupported combinations are caller errors.
    pub fn resolve(task: TaskKey) -> Result<&'static Endpoint> {
        ENDPOINTS
            .iter()
            .find(|endpoint| endpoint.task == task)
            .ok_or_else(|| Error::InvalidInput(format!("{task} is not a supported ingestion task")))
    }

    pub fn validate(&self, filters: &Filters, max_page_size: u32) -> Result<()> {
        if let (Some(from), Some(to)) = (filters.from, filters.to) {
            if from > to {
                return Err(Error::InvalidInput(format!(
                    "date range is inverted: {from} is after {to}"
                )));
            }
        }

        if let Some(size) = filters.page_size {
            if size == 0 || size > max_page_size {
                return Err(Error::InvalidInput(format!(
                    "page size must be between 1 and {max_page_size}, got {size}"
                )));
            }
        }

        if self.requires_category
            && filters.category.as_deref().map_or(true, |c| c.trim().is_empty())
        {
            return Err(Error::InvalidInput(format!(
                "{} requires a category filter",
                self.task
            )));
        }

        Ok(())
    }

    /// Remote query pairs for the caller's filters, in a stable order.
    pub fn query_params(&self, filters: &Filters) -> Vec<(&'static str, String)> {
        let names = &self.filters;
        let candidates = [
            (names.from, filters.from.map(|d| d.format("%Y-%m-%d").to_string())),
            (names.to, filters.to.map(|d| d.format("%Y-%m-%d").to_string())),
            (names.search, filters.search.clone()),
            (names.party, filters.party.clone()),
            (names.committee, filters.committee.clone()),
            (names.member_id, filters.member_id.clone()),
            (names.doc_type, filters.doc_type.clone()),
            (names.riksmote, filters.riksmote.clone()),
            (names.category, filters.category.clone()),
        ];

        candidates
            .into_iter()
            .filter_map(|(name, value)| {
                let value = value?.trim().to_string();
                match name {
                    Some(name) if !value.is_empty() => Some((name, value)),
                    _ => None,
                }
            })
            .collect()
    }

    pub fn first_page_url(&self, api_base_url: &str, filters: &Filters, page_size: u32) -> Result<String> {
        let base = format!("{}{}", api_base_url.trim_end_matches('/'), self.path);
        let mut params: Vec<(&str, String)> = self
            .fixed_params
            .iter()
            .map(|(key, value)| (*key, value.to_string()))
            .collect();
        params.extend(self.query_params(filters));
        params.push((self.size_param, page_size.to_string()));
        params.push((self.page_param, "1".to_string()));

        let url = Url::parse_with_params(&base, &params)
            .map_err(|e| Error::Config(format!("invalid base url '{base}': {e}")))?;
        Ok(url.to_string())
    }
}
