use std::cell::RefCell;
use std::fmt;

use crate::incr::Incr;
use crate::kind::{Kind, NodeGenerics};
use crate::node::{ErasedNode, Input, Node};
use crate::Value;

/// Generates one fixed-arity map payload, its [NodeGenerics] impl, and the
/// matching `Incr` constructor method. All the mappers are boxed `dyn FnMut`
/// so the payload types stay small and the `Kind` enum stays concrete.
macro_rules! map_node {
    (
        $node:ident, Kind::$kind:ident, Incr::$method:ident,
        { $field1:ident : $T1:ident => $I1:ident $(, $field:ident : $T:ident => $I:ident)* $(,)? },
        defaults { $($d:ident),* $(,)? }
    ) => {
        pub(crate) struct $node<$T1, $($T,)* R>
        where
            $T1: Value,
            $($T: Value,)*
            R: Value,
        {
            pub(crate) $field1: Input<$T1>,
            $(pub(crate) $field: Input<$T>,)*
            pub(crate) mapper: RefCell<Box<dyn FnMut(&$T1 $(, &$T)*) -> R>>,
        }

        impl<$T1, $($T,)* R> NodeGenerics for $node<$T1, $($T,)* R>
        where
            $T1: Value,
            $($T: Value,)*
            R: Value,
        {
            type R = R;
            type $I1 = $T1;
            $(type $I = $T;)*
            crate::kind::node_generics_default! { BindLhs, BindRhs, Fold, Update $(, $d)* }
        }

        impl<$T1, $($T,)* R> fmt::Debug for $node<$T1, $($T,)* R>
        where
            $T1: Value,
            $($T: Value,)*
            R: Value,
        {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.debug_struct(stringify!($node)).finish()
            }
        }

        impl<$T1: Value> Incr<$T1> {
            /// Derives a new incremental by applying `f` to the latest
            /// value(s) of the input(s). `f` reruns only when an input's
            /// change was not cut off.
            pub fn $method<$($T,)* R, F>(&self $(, $field: &Incr<$T>)*, f: F) -> Incr<R>
            where
                $($T: Value,)*
                R: Value,
                F: FnMut(&$T1 $(, &$T)*) -> R + 'static,
            {
                let state = self.node.state();
                let node = Node::<$node<$T1, $($T,)* R>>::create_rc(
                    state.weak(),
                    state.current_scope(),
                    Kind::$kind($node {
                        $field1: self.node.clone(),
                        $($field: $field.node.clone(),)*
                        mapper: RefCell::new(Box::new(f)),
                    }),
                );
                Incr { node }
            }
        }
    };
}

map_node!(MapNode, Kind::Map, Incr::map,
    { input: T1 => I1 },
    defaults { I2, I3, I4, I5, I6, I7, I8, I9 });

map_node!(Map2Node, Kind::Map2, Incr::map2,
    { one: T1 => I1, two: T2 => I2 },
    defaults { I3, I4, I5, I6, I7, I8, I9 });

map_node!(Map3Node, Kind::Map3, Incr::map3,
    { one: T1 => I1, two: T2 => I2, three: T3 => I3 },
    defaults { I4, I5, I6, I7, I8, I9 });

map_node!(Map4Node, Kind::Map4, Incr::map4,
    { one: T1 => I1, two: T2 => I2, three: T3 => I3, four: T4 => I4 },
    defaults { I5, I6, I7, I8, I9 });

map_node!(Map5Node, Kind::Map5, Incr::map5,
    { one: T1 => I1, two: T2 => I2, three: T3 => I3, four: T4 => I4, five: T5 => I5 },
    defaults { I6, I7, I8, I9 });

map_node!(Map6Node, Kind::Map6, Incr::map6,
    { one: T1 => I1, two: T2 => I2, three: T3 => I3, four: T4 => I4, five: T5 => I5,
      six: T6 => I6 },
    defaults { I7, I8, I9 });

map_node!(Map7Node, Kind::Map7, Incr::map7,
    { one: T1 => I1, two: T2 => I2, three: T3 => I3, four: T4 => I4, five: T5 => I5,
      six: T6 => I6, seven: T7 => I7 },
    defaults { I8, I9 });

map_node!(Map8Node, Kind::Map8, Incr::map8,
    { one: T1 => I1, two: T2 => I2, three: T3 => I3, four: T4 => I4, five: T5 => I5,
      six: T6 => I6, seven: T7 => I7, eight: T8 => I8 },
    defaults { I9 });

map_node!(Map9Node, Kind::Map9, Incr::map9,
    { one: T1 => I1, two: T2 => I2, three: T3 => I3, four: T4 => I4, five: T5 => I5,
      six: T6 => I6, seven: T7 => I7, eight: T8 => I8, nine: T9 => I9 },
    defaults { });
