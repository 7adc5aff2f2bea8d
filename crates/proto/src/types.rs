/// Every message kind the proxy recognizes, requests and responses, both
/// protocols. The request set is closed: a verb outside it is a parse error
/// and closes the client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    Unknown,

    // memcached requests
    ReqMcGet,
    ReqMcGets,
    ReqMcDelete,
    ReqMcCas,
    ReqMcSet,
    ReqMcAdd,
    ReqMcReplace,
    ReqMcAppend,
    ReqMcPrepend,
    ReqMcIncr,
    ReqMcDecr,
    ReqMcTouch,
    ReqMcQuit,

    // memcached responses
    RspMcNum,
    RspMcStored,
    RspMcNotStored,
    RspMcExists,
    RspMcNotFound,
    RspMcEnd,
    RspMcValue,
    RspMcDeleted,
    RspMcTouched,
    RspMcError,
    RspMcClientError,
    RspMcServerError,

    // redis requests - keys
    ReqRedisDel,
    ReqRedisExists,
    ReqRedisExpire,
    ReqRedisExpireat,
    ReqRedisPexpire,
    ReqRedisPexpireat,
    ReqRedisPersist,
    ReqRedisPttl,
    ReqRedisSort,
    ReqRedisTtl,
    ReqRedisType,
    ReqRedisTouch,
    ReqRedisUnlink,
    ReqRedisMove,
    ReqRedisCopy,
    ReqRedisDump,
    ReqRedisRestore,

    // redis requests - string
    ReqRedisAppend,
    ReqRedisBitcount,
    ReqRedisBitpos,
    ReqRedisBitfield,
    ReqRedisDecr,
    ReqRedisDecrby,
    ReqRedisGet,
    ReqRedisGetbit,
    ReqRedisGetdel,
    ReqRedisGetex,
    ReqRedisGetrange,
    ReqRedisGetset,
    ReqRedisIncr,
    ReqRedisIncrby,
    ReqRedisIncrbyfloat,
    ReqRedisMget,
    ReqRedisMset,
    ReqRedisPsetex,
    ReqRedisSet,
    ReqRedisSetbit,
    ReqRedisSetex,
    ReqRedisSetnx,
    ReqRedisSetrange,
    ReqRedisStrlen,

    // redis requests - hashes
    ReqRedisHdel,
    ReqRedisHexists,
    ReqRedisHget,
    ReqRedisHgetall,
    ReqRedisHincrby,
    ReqRedisHincrbyfloat,
    ReqRedisHkeys,
    ReqRedisHlen,
    ReqRedisHmget,
    ReqRedisHmset,
    ReqRedisHrandfield,
    ReqRedisHscan,
    ReqRedisHset,
    ReqRedisHsetnx,
    ReqRedisHstrlen,
    ReqRedisHvals,

    // redis requests - lists
    ReqRedisLindex,
    ReqRedisLinsert,
    ReqRedisLlen,
    ReqRedisLmove,
    ReqRedisLpop,
    ReqRedisLpos,
    ReqRedisLpush,
    ReqRedisLpushx,
    ReqRedisLrange,
    ReqRedisLrem,
    ReqRedisLset,
    ReqRedisLtrim,
    ReqRedisRpop,
    ReqRedisRpoplpush,
    ReqRedisRpush,
    ReqRedisRpushx,

    // redis requests - sets
    ReqRedisSadd,
    ReqRedisScard,
    ReqRedisSdiff,
    ReqRedisSdiffstore,
    ReqRedisSinter,
    ReqRedisSinterstore,
    ReqRedisSismember,
    ReqRedisSmembers,
    ReqRedisSmismember,
    ReqRedisSmove,
    ReqRedisSpop,
    ReqRedisSrandmember,
    ReqRedisSrem,
    ReqRedisSscan,
    ReqRedisSunion,
    ReqRedisSunionstore,

    // redis requests - sorted sets
    ReqRedisZadd,
    ReqRedisZcard,
    ReqRedisZcount,
    ReqRedisZdiff,
    ReqRedisZdiffstore,
    ReqRedisZincrby,
    ReqRedisZinter,
    ReqRedisZinterstore,
    ReqRedisZlexcount,
    ReqRedisZmscore,
    ReqRedisZpopmax,
    ReqRedisZpopmin,
    ReqRedisZrandmember,
    ReqRedisZrange,
    ReqRedisZrangebylex,
    ReqRedisZrangebyscore,
    ReqRedisZrangestore,
    ReqRedisZrank,
    ReqRedisZrem,
    ReqRedisZremrangebylex,
    ReqRedisZremrangebyrank,
    ReqRedisZremrangebyscore,
    ReqRedisZrevrange,
    ReqRedisZrevrangebylex,
    ReqRedisZrevrangebyscore,
    ReqRedisZrevrank,
    ReqRedisZscan,
    ReqRedisZscore,
    ReqRedisZunion,
    ReqRedisZunionstore,

    // redis requests - hyperloglog
    ReqRedisPfadd,
    ReqRedisPfcount,
    ReqRedisPfmerge,

    // redis requests - geo
    ReqRedisGeoadd,
    ReqRedisGeodist,
    ReqRedisGeohash,
    ReqRedisGeopos,
    ReqRedisGeoradius,
    ReqRedisGeoradiusbymember,
    ReqRedisGeosearch,
    ReqRedisGeosearchstore,

    // redis requests - eval and bare commands
    ReqRedisEval,
    ReqRedisEvalsha,
    ReqRedisPing,
    ReqRedisQuit,
    ReqRedisAuth,
    ReqRedisCommand,
    ReqRedisLolwut,

    // redis responses
    RspRedisStatus,
    RspRedisError,
    RspRedisErrorErr,
    RspRedisErrorOom,
    RspRedisErrorBusy,
    RspRedisErrorNoAuth,
    RspRedisErrorLoading,
    RspRedisErrorBusyKey,
    RspRedisErrorMisconf,
    RspRedisErrorNoScript,
    RspRedisErrorReadonly,
    RspRedisErrorWrongType,
    RspRedisErrorExecAbort,
    RspRedisErrorMasterDown,
    RspRedisErrorNoReplicas,
    RspRedisInteger,
    RspRedisBulk,
    RspRedisMultibulk,
}

/// Argument shape of a recognized Redis command. Drives arity validation and
/// key extraction during request parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedisClass {
    /// No arguments (PING, QUIT, COMMAND).
    Argz,
    /// Exactly a key (GET).
    Arg0,
    /// Key plus one argument (INCRBY).
    Arg1,
    /// Key plus two arguments (SETEX).
    Arg2,
    /// Key plus three arguments (LINSERT).
    Arg3,
    /// Key plus zero or more arguments (SET, ZADD).
    Argn,
    /// One or more keys (MGET, DEL).
    Argx,
    /// One or more key-value pairs (MSET).
    Argkvx,
    /// script/sha, numkeys, keys..., args... (EVAL).
    Argeval,
    /// No key at all (LOLWUT).
    Nokey,
}

impl MsgType {
    pub fn is_request(&self) -> bool {
        use MsgType::*;
        !matches!(self, Unknown) && !self.is_response()
    }

    pub fn is_response(&self) -> bool {
        use MsgType::*;
        matches!(
            self,
            RspMcNum
                | RspMcStored
                | RspMcNotStored
                | RspMcExists
                | RspMcNotFound
                | RspMcEnd
                | RspMcValue
                | RspMcDeleted
                | RspMcTouched
                | RspMcError
                | RspMcClientError
                | RspMcServerError
                | RspRedisStatus
                | RspRedisError
                | RspRedisErrorErr
                | RspRedisErrorOom
                | RspRedisErrorBusy
                | RspRedisErrorNoAuth
                | RspRedisErrorLoading
                | RspRedisErrorBusyKey
                | RspRedisErrorMisconf
                | RspRedisErrorNoScript
                | RspRedisErrorReadonly
                | RspRedisErrorWrongType
                | RspRedisErrorExecAbort
                | RspRedisErrorMasterDown
                | RspRedisErrorNoReplicas
                | RspRedisInteger
                | RspRedisBulk
                | RspRedisMultibulk
        )
    }

    pub fn is_error_response(&self) -> bool {
        use MsgType::*;
        matches!(
            self,
            RspMcError
                | RspMcClientError
                | RspMcServerError
                | RspRedisError
                | RspRedisErrorErr
                | RspRedisErrorOom
                | RspRedisErrorBusy
                | RspRedisErrorNoAuth
                | RspRedisErrorLoading
                | RspRedisErrorBusyKey
                | RspRedisErrorMisconf
                | RspRedisErrorNoScript
                | RspRedisErrorReadonly
                | RspRedisErrorWrongType
                | RspRedisErrorExecAbort
                | RspRedisErrorMasterDown
                | RspRedisErrorNoReplicas
        )
    }

    /// Storage verbs carrying a `<bytes>` data block.
    pub fn mc_storage(&self) -> bool {
        use MsgType::*;
        matches!(
            self,
            ReqMcSet | ReqMcCas | ReqMcAdd | ReqMcReplace | ReqMcAppend | ReqMcPrepend
        )
    }

    pub fn mc_retrieval(&self) -> bool {
        matches!(self, MsgType::ReqMcGet | MsgType::ReqMcGets)
    }

    pub fn mc_arithmetic(&self) -> bool {
        matches!(self, MsgType::ReqMcIncr | MsgType::ReqMcDecr)
    }

    /// Commands that may split into per-server sub-requests.
    pub fn fragmentable(&self) -> bool {
        use MsgType::*;
        matches!(
            self,
            ReqMcGet | ReqMcGets | ReqRedisMget | ReqRedisDel | ReqRedisUnlink | ReqRedisTouch
                | ReqRedisMset
        )
    }

    pub fn redis_class(&self) -> Option<RedisClass> {
        use MsgType::*;
        use RedisClass::*;
        let class = match self {
            ReqRedisPing | ReqRedisQuit | ReqRedisCommand => Argz,

            ReqRedisPersist | ReqRedisPttl | ReqRedisTtl | ReqRedisType | ReqRedisDump
            | ReqRedisDecr | ReqRedisGet | ReqRedisGetdel | ReqRedisIncr | ReqRedisStrlen
            | ReqRedisHgetall | ReqRedisHkeys | ReqRedisHlen | ReqRedisHvals | ReqRedisLlen
            | ReqRedisScard | ReqRedisSmembers | ReqRedisZcard | ReqRedisAuth => Arg0,

            ReqRedisExpire | ReqRedisExpireat | ReqRedisPexpire | ReqRedisPexpireat
            | ReqRedisMove | ReqRedisAppend | ReqRedisDecrby | ReqRedisGetbit | ReqRedisGetset
            | ReqRedisIncrby | ReqRedisIncrbyfloat | ReqRedisSetnx | ReqRedisHexists
            | ReqRedisHget | ReqRedisHstrlen | ReqRedisLindex | ReqRedisRpoplpush
            | ReqRedisSismember | ReqRedisZrank | ReqRedisZrevrank | ReqRedisZscore => Arg1,

            ReqRedisGetrange | ReqRedisPsetex | ReqRedisSetbit | ReqRedisSetex
            | ReqRedisSetrange | ReqRedisHincrby | ReqRedisHincrbyfloat | ReqRedisHsetnx
            | ReqRedisLrange | ReqRedisLrem | ReqRedisLset | ReqRedisLtrim | ReqRedisSmove
            | ReqRedisZcount | ReqRedisZlexcount | ReqRedisZincrby | ReqRedisZremrangebylex
            | ReqRedisZremrangebyrank | ReqRedisZremrangebyscore => Arg2,

            ReqRedisLinsert | ReqRedisLmove => Arg3,

            ReqRedisSort | ReqRedisCopy | ReqRedisBitcount | ReqRedisBitpos | ReqRedisBitfield
            | ReqRedisExists | ReqRedisGetex | ReqRedisSet | ReqRedisHdel | ReqRedisHmget
            | ReqRedisHmset | ReqRedisHscan | ReqRedisHset | ReqRedisHrandfield
            | ReqRedisLpush | ReqRedisLpushx | ReqRedisRpush | ReqRedisRpushx | ReqRedisLpop
            | ReqRedisRpop | ReqRedisLpos | ReqRedisSadd | ReqRedisSdiff | ReqRedisSdiffstore
            | ReqRedisSinter | ReqRedisSinterstore | ReqRedisSrem | ReqRedisSunion
            | ReqRedisSunionstore | ReqRedisSrandmember | ReqRedisSscan | ReqRedisSpop
            | ReqRedisSmismember | ReqRedisPfadd | ReqRedisPfmerge | ReqRedisPfcount
            | ReqRedisZadd | ReqRedisZdiff | ReqRedisZdiffstore | ReqRedisZinter
            | ReqRedisZinterstore | ReqRedisZmscore | ReqRedisZpopmax | ReqRedisZpopmin
            | ReqRedisZrandmember | ReqRedisZrange | ReqRedisZrangebylex
            | ReqRedisZrangebyscore | ReqRedisZrangestore | ReqRedisZrem | ReqRedisZrevrange
            | ReqRedisZrevrangebylex | ReqRedisZrevrangebyscore | ReqRedisZscan
            | ReqRedisZunion | ReqRedisZunionstore | ReqRedisGeodist | ReqRedisGeopos
            | ReqRedisGeohash | ReqRedisGeoadd | ReqRedisGeoradius | ReqRedisGeoradiusbymember
            | ReqRedisGeosearch | ReqRedisGeosearchstore | ReqRedisRestore => Argn,

            ReqRedisMget | ReqRedisDel | ReqRedisUnlink | ReqRedisTouch => Argx,

            ReqRedisMset => Argkvx,

            ReqRedisEval | ReqRedisEvalsha => Argeval,

            ReqRedisLolwut => Nokey,

            _ => return None,
        };
        Some(class)
    }
}
