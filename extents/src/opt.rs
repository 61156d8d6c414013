use std::env;

use crate::dss::DssPrecedence;
use crate::size_class::{MAX_CLASS, PAGE};

pub fn retain() -> bool {
    lazy_static! {
        static ref VALUE: bool = {
            let flag = env::var_os( "EXTENTS_RETAIN" )
                .map( |value| value != "0" )
                .unwrap_or( true );

            if flag {
                info!( "Will retain mappings instead of unmapping: yes" );
            } else {
                info!( "Will retain mappings instead of unmapping: no" );
            }

            flag
        };
    }

    *VALUE
}

pub fn dss_precedence() -> DssPrecedence {
    lazy_static! {
        static ref VALUE: DssPrecedence = {
            let precedence = env::var( "EXTENTS_DSS" ).ok()
                .and_then( |value| DssPrecedence::from_str( &value ) )
                .unwrap_or( DssPrecedence::Disabled );

            info!( "Contiguous heap precedence: {:?}", precedence );
            precedence
        };
    }

    *VALUE
}

pub fn grow_limit() -> usize {
    lazy_static! {
        static ref VALUE: usize = {
            let limit = env::var( "EXTENTS_GROW_LIMIT" ).ok()
                .and_then( |value| value.parse::< usize >().ok() )
                .map( |value| value.max( PAGE ).min( MAX_CLASS ) )
                .unwrap_or( MAX_CLASS );

            info!( "Will grow the retained pool by at most {} byte(s) at a time", limit );
            limit
        };
    }

    *VALUE
}
