use std::fmt;

use crate::Section;

macro_rules! object_classes {
    ($($variant:ident => $desc:literal, $section:ident;)*) => {
        #[derive(Clone, Debug, PartialEq, Eq, Hash)]
        /// Object kind of a TOC entry.
        ///
        /// The textual description is what gets stored in archives, so
        /// unknown kinds read from an archive are kept as
        /// [`ObjectClass::Other`].
        pub enum ObjectClass {
            $($variant,)*
            Other(String),
        }

        impl ObjectClass {
            /// Description as stored in the TOC.
            pub fn desc(&self) -> &str {
                match self {
                    $(ObjectClass::$variant => $desc,)*
                    ObjectClass::Other(desc) => desc,
                }
            }

            /// Section an entry of this kind belongs to unless told otherwise.
            pub fn default_section(&self) -> Section {
                match self {
                    $(ObjectClass::$variant => Section::$section,)*
                    ObjectClass::Other(_) => Section::PreData,
                }
            }

            pub fn from_desc(desc: &str) -> Self {
                match desc {
                    $($desc => ObjectClass::$variant,)*
                    other => ObjectClass::Other(other.to_string()),
                }
            }
        }
    };
}

object_classes! {
    Schema => "SCHEMA", PreData;
    Extension => "EXTENSION", PreData;
    Type => "TYPE", PreData;
    ShellType => "SHELL TYPE", PreData;
    DummyType => "DUMMY TYPE", PreData;
    Domain => "DOMAIN", PreData;
    Function => "FUNCTION", PreData;
    Aggregate => "AGGREGATE", PreData;
    Operator => "OPERATOR", PreData;
    AccessMethod => "ACCESS METHOD", PreData;
    OperatorClass => "OPERATOR CLASS", PreData;
    OperatorFamily => "OPERATOR FAMILY", PreData;
    Collation => "COLLATION", PreData;
    Conversion => "CONVERSION", PreData;
    Table => "TABLE", PreData;
    View => "VIEW", PreData;
    MaterializedView => "MATERIALIZED VIEW", PreData;
    Sequence => "SEQUENCE", PreData;
    ColumnDefault => "DEFAULT", PreData;
    CheckConstraint => "CHECK CONSTRAINT", PreData;
    ProceduralLanguage => "PROCEDURAL LANGUAGE", PreData;
    Cast => "CAST", PreData;
    Transform => "TRANSFORM", PreData;
    TextSearchParser => "TEXT SEARCH PARSER", PreData;
    TextSearchDictionary => "TEXT SEARCH DICTIONARY", PreData;
    TextSearchTemplate => "TEXT SEARCH TEMPLATE", PreData;
    TextSearchConfiguration => "TEXT SEARCH CONFIGURATION", PreData;
    ForeignDataWrapper => "FOREIGN DATA WRAPPER", PreData;
    ForeignServer => "SERVER", PreData;
    LargeObject => "LARGE OBJECT", PreData;
    Database => "DATABASE", PreData;
    Comment => "COMMENT", None;
    Encoding => "ENCODING", PreData;
    StdStrings => "STDSTRINGS", PreData;
    SearchPath => "SEARCHPATH", PreData;
    TableData => "TABLE DATA", Data;
    SequenceSet => "SEQUENCE SET", Data;
    Blobs => "BLOBS", Data;
    PreDataBoundary => "PRE-DATA BOUNDARY", None;
    PostDataBoundary => "POST-DATA BOUNDARY", None;
    Index => "INDEX", PostData;
    Rule => "RULE", PostData;
    Trigger => "TRIGGER", PostData;
    EventTrigger => "EVENT TRIGGER", PostData;
    FkConstraint => "FK CONSTRAINT", PostData;
    Constraint => "CONSTRAINT", PostData;
    MaterializedViewData => "MATERIALIZED VIEW DATA", PostData;
    Policy => "POLICY", PostData;
    DefaultAcl => "DEFAULT ACL", None;
    Acl => "ACL", None;
}

impl ObjectClass {
    pub fn is_boundary(&self) -> bool {
        matches!(
            self,
            ObjectClass::PreDataBoundary | ObjectClass::PostDataBoundary
        )
    }

    /// Privilege entries, skipped when ACLs are not restored.
    pub fn is_acl(&self) -> bool {
        matches!(self, ObjectClass::Acl | ObjectClass::DefaultAcl)
    }

    /// Entries whose data payload is handled like table data, even
    /// without a data dumper.
    pub fn is_data_kind(&self) -> bool {
        matches!(
            self,
            ObjectClass::TableData
                | ObjectClass::SequenceSet
                | ObjectClass::Blobs
                | ObjectClass::MaterializedViewData
        )
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.desc())
    }
}

impl std::str::FromStr for ObjectClass {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ObjectClass::from_desc(s))
    }
}

proxmox_serde::forward_deserialize_to_from_str!(ObjectClass);
proxmox_serde::forward_serialize_to_display!(ObjectClass);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn desc_round_trip() {
        for class in [
            ObjectClass::Table,
            ObjectClass::TableData,
            ObjectClass::CheckConstraint,
            ObjectClass::PreDataBoundary,
        ] {
            assert_eq!(ObjectClass::from_desc(class.desc()), class);
        }
        assert_eq!(
            ObjectClass::from_desc("STATISTICS"),
            ObjectClass::Other("STATISTICS".to_string())
        );
        assert_eq!(ObjectClass::Index.default_section(), Section::PostData);
        assert_eq!(ObjectClass::Blobs.default_section(), Section::Data);
    }
}
